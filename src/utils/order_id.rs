/// 订单ID生成器
///
/// 为每个策略生成唯一且可识别的客户端订单ID
use chrono::Utc;
use rand::Rng;

/// 生成带策略标签的客户端订单ID
///
/// 格式: {tag}{毫秒时间戳}{4位随机数}，总长度不超过32字符
pub fn generate_order_id_with_tag(tag: &str) -> String {
    let ts = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("{}{}{:04}", tag, ts, suffix)
}

/// 生成默认标签的订单ID
pub fn generate_order_id() -> String {
    generate_order_id_with_tag("RS")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ids_are_unique() {
        let a = generate_order_id_with_tag("GRID");
        let b = generate_order_id_with_tag("GRID");
        assert_ne!(a, b);
        assert!(a.starts_with("GRID"));
        assert!(a.len() <= 32);
    }
}
