// 工具模块 - 通用工具函数
pub mod clock;
pub mod order_id;

pub use clock::{crossed_day_boundary, day_anchor};
pub use order_id::{generate_order_id, generate_order_id_with_tag};
