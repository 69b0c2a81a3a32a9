//! 随机订单生成器

use std::ops::RangeInclusive;

use order_stream_shared::order::Order;
use rand::Rng;

/// 随机订单生成器
///
/// 每个订单使用新的 UUID v4 作为 ID，商品名称固定，金额在区间内均匀分布。
#[derive(Debug, Clone)]
pub struct OrderGenerator {
    item: String,
    amounts: RangeInclusive<i64>,
}

impl Default for OrderGenerator {
    fn default() -> Self {
        Self::new("Product-X")
    }
}

impl OrderGenerator {
    /// 默认金额区间 1..=5
    pub fn new(item: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            amounts: 1..=5,
        }
    }

    /// 自定义金额区间，两端顺序颠倒时自动交换
    pub fn with_amounts(mut self, min: i64, max: i64) -> Self {
        self.amounts = min.min(max)..=min.max(max);
        self
    }

    pub fn item(&self) -> &str {
        &self.item
    }

    pub fn next_order(&self) -> Order {
        let amount = rand::thread_rng().gen_range(self.amounts.clone());
        Order::new(self.item.clone(), amount)
    }
}
