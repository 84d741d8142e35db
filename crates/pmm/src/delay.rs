//! 分配延迟策略
//!
//! 在“等到水位触发后才延迟”的状态下，可等待的分配是否返回 `ShouldWait`
//! 由这里的策略决定。正式环境使用 [`NeverDelay`]；
//! [`RandomDelay`] 随机延迟一部分分配，用来覆盖调用者的重试路径。

/// 分配延迟策略
pub trait AllocDelayPolicy: Send {
    /// 本次可等待的分配是否应当延迟
    fn should_delay(&mut self) -> bool;

    /// 重新设置随机种子
    fn reseed(&mut self, _seed: u64) {}
}

/// 从不延迟
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverDelay;

impl AllocDelayPolicy for NeverDelay {
    fn should_delay(&mut self) -> bool {
        false
    }
}

/// 按固定比例随机延迟（xorshift64）
#[derive(Debug, Clone)]
pub struct RandomDelay {
    state: u64,
    one_in: u64,
}

impl RandomDelay {
    /// 默认每 10 次分配延迟 1 次
    pub const DEFAULT_ONE_IN: u64 = 10;

    /// 以默认比例创建
    pub fn new(seed: u64) -> Self {
        Self::with_ratio(seed, Self::DEFAULT_ONE_IN)
    }

    /// 每 `one_in` 次分配平均延迟 1 次
    pub fn with_ratio(seed: u64, one_in: u64) -> Self {
        assert!(one_in > 0);
        RandomDelay {
            state: Self::fix_seed(seed),
            one_in,
        }
    }

    // xorshift 的状态不能为 0
    fn fix_seed(seed: u64) -> u64 {
        if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

impl AllocDelayPolicy for RandomDelay {
    fn should_delay(&mut self) -> bool {
        self.next() % self.one_in == 0
    }

    fn reseed(&mut self, seed: u64) {
        self.state = Self::fix_seed(seed);
    }
}
