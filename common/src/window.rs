//! 滚动窗口与自适应退避
//!
//! 固定大小的环形计数数组，按相对参考时间的秒数定位桶。
//! 用来识别"M 秒内发生 N 次变化"这类抖动模式，并据此计算延迟。

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

/// 抖动档位：`seconds` 秒内达到 `max` 次即触发，对应延迟 `delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChurnTier {
    pub seconds: u64,
    pub max: u32,
    pub delay: Duration,
}

impl ChurnTier {
    pub const fn new(seconds: u64, max: u32, delay: Duration) -> Self {
        Self { seconds, max, delay }
    }
}

/// 默认档位：1秒2次、3秒3次、6秒4次、10秒6次，延迟逐级变大
pub const DEFAULT_TIERS: [ChurnTier; 4] = [
    ChurnTier::new(1, 2, Duration::from_secs(1)),
    ChurnTier::new(3, 3, Duration::from_secs(3)),
    ChurnTier::new(6, 4, Duration::from_secs(6)),
    ChurnTier::new(10, 6, Duration::from_secs(10)),
];

/// 连续触发多少次后进入升级模式
const SHIFT_AFTER: u32 = 3;
/// 升级的最大级数
const MAX_SHIFT_LEVEL: u32 = 4;

#[derive(Debug)]
struct WindowState {
    buckets: Vec<u32>,
    origin: Instant,
    /// 最近一次推进到的秒偏移
    head: u64,
}

impl WindowState {
    fn offset(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_secs()
    }

    /// 时间前进时清空被跨过的桶
    fn advance(&mut self, sec: u64) {
        if sec <= self.head {
            return;
        }
        let size = self.buckets.len() as u64;
        let steps = (sec - self.head).min(size);
        for step in 1..=steps {
            let idx = ((self.head + step) % size) as usize;
            self.buckets[idx] = 0;
        }
        self.head = sec;
    }

    fn sum(&self, seconds: u64) -> u32 {
        let size = self.buckets.len() as u64;
        let span = seconds.min(size).min(self.head + 1);
        (0..span)
            .map(|back| self.buckets[((self.head - back) % size) as usize])
            .sum()
    }
}

/// 滚动计数窗口
///
/// `append` 与 `matches` 共用一把锁，临界区只有 O(窗口大小) 的计算
#[derive(Debug)]
pub struct RollingWindow {
    state: Mutex<WindowState>,
}

impl RollingWindow {
    pub fn new(size: usize) -> Self {
        Self::with_origin(size, Instant::now())
    }

    pub fn with_origin(size: usize, origin: Instant) -> Self {
        Self {
            state: Mutex::new(WindowState {
                buckets: vec![0; size.max(1)],
                origin,
                head: 0,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().buckets.len()
    }

    /// 记录一次事件
    pub fn append(&self, now: Instant) {
        let mut state = self.state.lock();
        let sec = state.offset(now);
        state.advance(sec);
        let size = state.buckets.len() as u64;
        // 早于窗口的事件直接丢弃
        if sec + size <= state.head {
            return;
        }
        let idx = (sec % size) as usize;
        state.buckets[idx] = state.buckets[idx].saturating_add(1);
    }

    /// 截止 `now` 的最近 `seconds` 秒内的事件数
    pub fn count(&self, now: Instant, seconds: u64) -> u32 {
        let mut state = self.state.lock();
        let sec = state.offset(now);
        state.advance(sec);
        state.sum(seconds)
    }

    /// 最近 `seconds` 秒内的事件数是否达到 `max`
    pub fn matches(&self, now: Instant, seconds: u64, max: u32) -> bool {
        self.count(now, seconds) >= max
    }
}

#[derive(Debug, Default)]
struct BackoffState {
    delay: Duration,
    /// 产生当前延迟的档位，衰减系数取自它
    tier: Option<ChurnTier>,
    consecutive: u32,
    level: u32,
}

/// 自适应退避
///
/// 每次事件写入窗口后按档位从大到小匹配，命中的档位决定延迟；
/// 没有命中时延迟乘以该档位的 `max / seconds`，结果同样不超过上限。
/// 开启 shift 后，连续三次命中会叠加倍数和随机抖动，之后每次未命中降一级。
#[derive(Debug)]
pub struct AdaptiveBackoff {
    window: RollingWindow,
    tiers: Vec<ChurnTier>,
    ceiling: Duration,
    shift: bool,
    state: Mutex<BackoffState>,
}

impl AdaptiveBackoff {
    pub fn new(ceiling: Duration) -> Self {
        Self::with_tiers(DEFAULT_TIERS.to_vec(), ceiling, Instant::now())
    }

    pub fn with_tiers(mut tiers: Vec<ChurnTier>, ceiling: Duration, origin: Instant) -> Self {
        tiers.sort_by_key(|tier| tier.seconds);
        let size = tiers.iter().map(|tier| tier.seconds).max().unwrap_or(1) as usize;
        Self {
            window: RollingWindow::with_origin(size, origin),
            tiers,
            ceiling,
            shift: false,
            state: Mutex::new(BackoffState::default()),
        }
    }

    pub fn with_shift(mut self, shift: bool) -> Self {
        self.shift = shift;
        self
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    /// 当前延迟
    pub fn delay(&self) -> Duration {
        self.state.lock().delay
    }

    /// 记录一次变化并返回应当施加的延迟
    pub fn record(&self, now: Instant) -> Duration {
        self.window.append(now);
        let tier = self
            .tiers
            .iter()
            .rev()
            .find(|tier| self.window.matches(now, tier.seconds, tier.max))
            .copied();
        self.settle(tier)
    }

    /// 一次平静的调用：不写入事件，只做衰减和降级
    pub fn relax(&self) -> Duration {
        self.settle(None)
    }

    fn settle(&self, tier: Option<ChurnTier>) -> Duration {
        let mut state = self.state.lock();
        match tier {
            Some(tier) => {
                state.consecutive += 1;
                let mut delay = state.delay.max(tier.delay);
                if self.shift && state.consecutive >= SHIFT_AFTER {
                    state.level = (state.level + 1).min(MAX_SHIFT_LEVEL);
                    delay = delay.saturating_mul(1 << state.level);
                    let jitter_ms = (delay.as_millis() as u64 / 2).max(1);
                    delay += Duration::from_millis(rand::rng().random_range(0..jitter_ms));
                }
                state.delay = delay.min(self.ceiling);
                state.tier = Some(tier);
            }
            None => {
                state.consecutive = 0;
                state.level = state.level.saturating_sub(1);
                let Some(tier) = state.tier else {
                    return state.delay;
                };
                let factor = tier.max as f64 / tier.seconds.max(1) as f64;
                let decayed = state.delay.mul_f64(factor).min(self.ceiling);
                if decayed < Duration::from_millis(1) {
                    state.delay = Duration::ZERO;
                    state.tier = None;
                } else {
                    state.delay = decayed;
                }
            }
        }
        state.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(origin: Instant, s: u64) -> Instant {
        origin + Duration::from_secs(s)
    }

    #[test]
    fn counts_within_trailing_span() {
        let origin = Instant::now();
        let window = RollingWindow::with_origin(10, origin);
        window.append(secs(origin, 0));
        window.append(secs(origin, 1));
        window.append(secs(origin, 2));

        assert!(window.matches(secs(origin, 2), 3, 3));
        assert!(!window.matches(secs(origin, 2), 1, 2));
        assert_eq!(window.count(secs(origin, 2), 2), 2);
    }

    #[test]
    fn old_buckets_are_reset_as_time_rolls() {
        let origin = Instant::now();
        let window = RollingWindow::with_origin(3, origin);
        window.append(secs(origin, 0));
        window.append(secs(origin, 0));
        assert_eq!(window.count(secs(origin, 0), 3), 2);

        // 跨过整个窗口后旧数据全部失效
        assert_eq!(window.count(secs(origin, 5), 3), 0);
        window.append(secs(origin, 5));
        assert_eq!(window.count(secs(origin, 5), 3), 1);

        // 窗口之外的旧事件被丢弃
        window.append(secs(origin, 1));
        assert_eq!(window.count(secs(origin, 5), 3), 1);
    }

    #[test]
    fn single_event_triggers_nothing() {
        let origin = Instant::now();
        let backoff = AdaptiveBackoff::with_tiers(DEFAULT_TIERS.to_vec(), Duration::from_secs(10), origin);
        assert_eq!(backoff.record(secs(origin, 0)), Duration::ZERO);
    }

    #[test]
    fn three_events_in_three_seconds_apply_tier_delay() {
        let origin = Instant::now();
        let backoff = AdaptiveBackoff::with_tiers(DEFAULT_TIERS.to_vec(), Duration::from_secs(10), origin);
        assert_eq!(backoff.record(secs(origin, 0)), Duration::ZERO);
        assert_eq!(backoff.record(secs(origin, 1)), Duration::ZERO);
        assert!(backoff.window().matches(secs(origin, 1), 3, 2));

        let delay = backoff.record(secs(origin, 2));
        assert!(backoff.window().matches(secs(origin, 2), 3, 3));
        assert_eq!(delay, Duration::from_secs(3));
    }

    #[test]
    fn delay_decays_and_respects_ceiling() {
        let origin = Instant::now();
        let backoff = AdaptiveBackoff::with_tiers(DEFAULT_TIERS.to_vec(), Duration::from_secs(2), origin);
        backoff.record(secs(origin, 0));
        let delay = backoff.record(secs(origin, 0));
        // 1秒2次命中第一档，1s 未超过上限
        assert_eq!(delay, Duration::from_secs(1));
        // 第一档系数 2/1，放大后仍被上限截断
        assert_eq!(backoff.relax(), Duration::from_secs(2));
        assert_eq!(backoff.relax(), Duration::from_secs(2));

        backoff.record(secs(origin, 0));
        // 命中 3秒3次 档位 (3s)，被上限截断，系数 3/3 保持不变
        assert_eq!(backoff.delay(), Duration::from_secs(2));
        assert_eq!(backoff.relax(), Duration::from_secs(2));
    }

    #[test]
    fn decay_factor_comes_from_triggering_tier() {
        let origin = Instant::now();
        let backoff = AdaptiveBackoff::with_tiers(
            vec![ChurnTier::new(10, 6, Duration::from_secs(10))],
            Duration::from_secs(60),
            origin,
        );
        for _ in 0..5 {
            assert_eq!(backoff.record(secs(origin, 0)), Duration::ZERO);
        }
        assert_eq!(backoff.record(secs(origin, 0)), Duration::from_secs(10));

        // 10秒6次：每次衰减为 0.6 倍
        assert_eq!(backoff.relax(), Duration::from_secs(6));
        let next = backoff.relax();
        assert!(next > Duration::from_millis(3590) && next < Duration::from_millis(3610));

        // 衰减到 1ms 以下归零，之后保持为零
        while backoff.relax() > Duration::ZERO {}
        assert_eq!(backoff.relax(), Duration::ZERO);
        assert!(backoff.state.lock().tier.is_none());
    }

    #[test]
    fn shift_escalates_then_steps_down() {
        let origin = Instant::now();
        let backoff = AdaptiveBackoff::with_tiers(
            vec![ChurnTier::new(1, 1, Duration::from_millis(100))],
            Duration::from_secs(60),
            origin,
        )
        .with_shift(true);

        assert_eq!(backoff.record(secs(origin, 0)), Duration::from_millis(100));
        assert_eq!(backoff.record(secs(origin, 1)), Duration::from_millis(100));
        // 第三次连续命中：翻倍并叠加抖动
        let escalated = backoff.record(secs(origin, 2));
        assert!(escalated >= Duration::from_millis(200));
        assert!(escalated < Duration::from_millis(300));

        // 未命中：降一级，1秒1次 档位的系数为 1，延迟保持
        assert_eq!(backoff.relax(), escalated);
        assert_eq!(backoff.state.lock().level, 0);
    }
}
