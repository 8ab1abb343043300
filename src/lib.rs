#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod core;
pub mod engine;
pub mod storage;
pub mod strategies;
pub mod utils;

// 选择性导出，避免命名冲突
pub use core::{config::*, error::*, types::*};
pub use engine::{ExecutionCoordinator, RecoveryLoader};
pub use storage::{FileStore, MemoryStore, StateStore};
pub use strategies::{DcaStrategy, GridStrategy, StrategyKind};
