//! Lossy transport wrapper for testing unreliable delivery.
//!
//! Wraps any `InterPartitionTransport` and drops messages either randomly
//! (by probability) or selectively (through an interceptor). Dropped
//! messages are reported as sent, exactly like a network that lost them.
//!
//! ```ignore
//! let lossy = LossyTransport::new(LocalTransport::new(), LossyConfig::none());
//!
//! // Drop the first DISTRIBUTE headed for partition 2.
//! let dropped = AtomicBool::new(false);
//! lossy.intercept(move |receiver, message| {
//!     receiver != 2 || dropped.swap(true, Ordering::SeqCst)
//! });
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;
use tracing::{debug, warn};

use crate::record::PartitionId;

use super::{InterPartitionMessage, InterPartitionTransport, TransportError};

/// Decides per message whether it is delivered (`true`) or dropped.
pub type Interceptor = Arc<dyn Fn(PartitionId, &InterPartitionMessage) -> bool + Send + Sync>;

/// Configuration for lossy behavior.
#[derive(Clone, Debug)]
pub struct LossyConfig {
    /// Probability of dropping a message (0.0 to 1.0).
    pub drop_rate: f64,
    /// Whether to log dropped messages.
    pub log_drops: bool,
}

impl Default for LossyConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl LossyConfig {
    /// Never drop randomly.
    pub fn none() -> Self {
        Self {
            drop_rate: 0.0,
            log_drops: false,
        }
    }

    /// Drop with the given probability, clamped to `[0, 1]`.
    pub fn with_drop_rate(rate: f64) -> Self {
        Self {
            drop_rate: rate.clamp(0.0, 1.0),
            log_drops: true,
        }
    }

    pub fn drop_all() -> Self {
        Self {
            drop_rate: 1.0,
            log_drops: true,
        }
    }

    pub fn with_logging(mut self, log: bool) -> Self {
        self.log_drops = log;
        self
    }

    pub fn is_lossy(&self) -> bool {
        self.drop_rate > 0.0
    }
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct LossyStats {
    pub total: AtomicU64,
    pub dropped: AtomicU64,
    pub passed: AtomicU64,
}

impl LossyStats {
    /// `(total, dropped, passed)`.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.passed.load(Ordering::Relaxed),
        )
    }

    pub fn observed_drop_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.dropped.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.passed.store(0, Ordering::Relaxed);
    }
}

/// Transport that may lose messages.
pub struct LossyTransport<T: InterPartitionTransport> {
    inner: T,
    config: RwLock<LossyConfig>,
    interceptor: RwLock<Option<Interceptor>>,
    stats: LossyStats,
}

impl<T: InterPartitionTransport> LossyTransport<T> {
    pub fn new(inner: T, config: LossyConfig) -> Self {
        if config.is_lossy() {
            warn!(
                drop_rate = config.drop_rate,
                "Lossy transport enabled - messages may be dropped"
            );
        }
        Self {
            inner,
            config: RwLock::new(config),
            interceptor: RwLock::new(None),
            stats: LossyStats::default(),
        }
    }

    pub fn passthrough(inner: T) -> Self {
        Self::new(inner, LossyConfig::none())
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn stats(&self) -> &LossyStats {
        &self.stats
    }

    pub fn set_drop_rate(&self, rate: f64) {
        if let Ok(mut config) = self.config.write() {
            config.drop_rate = rate.clamp(0.0, 1.0);
        }
    }

    /// Route every message through `interceptor`; it returns `false` to
    /// drop the message.
    pub fn intercept<F>(&self, interceptor: F)
    where
        F: Fn(PartitionId, &InterPartitionMessage) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.interceptor.write() {
            *slot = Some(Arc::new(interceptor));
        }
    }

    pub fn clear_interceptor(&self) {
        if let Ok(mut slot) = self.interceptor.write() {
            *slot = None;
        }
    }

    fn should_drop(&self, receiver: PartitionId, message: &InterPartitionMessage) -> bool {
        let interceptor = self.interceptor.read().ok().and_then(|slot| slot.clone());
        if let Some(interceptor) = interceptor {
            if !interceptor(receiver, message) {
                return true;
            }
        }

        let drop_rate = self.config.read().map(|c| c.drop_rate).unwrap_or(0.0);
        if drop_rate <= 0.0 {
            return false;
        }
        if drop_rate >= 1.0 {
            return true;
        }
        rand::rng().random::<f64>() < drop_rate
    }
}

impl<T: InterPartitionTransport> InterPartitionTransport for LossyTransport<T> {
    fn send(
        &self,
        receiver: PartitionId,
        message: &InterPartitionMessage,
    ) -> Result<(), TransportError> {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        if self.should_drop(receiver, message) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            let log_drops = self.config.read().map(|c| c.log_drops).unwrap_or(false);
            if log_drops {
                debug!(
                    receiver,
                    kind = message.kind(),
                    distribution_key = message.distribution_key(),
                    "Lossy transport dropped message"
                );
            }
            return Ok(());
        }

        self.stats.passed.fetch_add(1, Ordering::Relaxed);
        self.inner.send(receiver, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use std::sync::atomic::AtomicBool;

    fn ack(key: i64) -> InterPartitionMessage {
        InterPartitionMessage::Acknowledge {
            distribution_key: key,
            target_partition: 2,
        }
    }

    #[test]
    fn test_config_clamps_drop_rate() {
        assert_eq!(LossyConfig::with_drop_rate(1.5).drop_rate, 1.0);
        assert_eq!(LossyConfig::with_drop_rate(-0.5).drop_rate, 0.0);
        assert!(!LossyConfig::none().is_lossy());
        assert!(LossyConfig::drop_all().is_lossy());
        assert!(!LossyConfig::drop_all().with_logging(false).log_drops);
    }

    #[test]
    fn test_passthrough_delivers_everything() {
        let lossy = LossyTransport::passthrough(LocalTransport::new());
        let inbox = lossy.inner().register(1);
        for key in 0..10 {
            lossy.send(1, &ack(key)).unwrap();
        }

        assert_eq!(inbox.drain().len(), 10);
        assert_eq!(lossy.stats().snapshot(), (10, 0, 10));
    }

    #[test]
    fn test_drop_all_delivers_nothing() {
        let lossy = LossyTransport::new(LocalTransport::new(), LossyConfig::drop_all());
        let inbox = lossy.inner().register(1);
        for key in 0..10 {
            lossy.send(1, &ack(key)).unwrap();
        }

        assert!(inbox.is_empty());
        assert_eq!(lossy.stats().observed_drop_rate(), 1.0);
    }

    #[test]
    fn test_interceptor_drops_selected_message_once() {
        let lossy = LossyTransport::passthrough(LocalTransport::new());
        let inbox = lossy.inner().register(1);
        let dropped = AtomicBool::new(false);
        lossy.intercept(move |_, message| {
            message.distribution_key() != 2 || dropped.swap(true, Ordering::SeqCst)
        });

        lossy.send(1, &ack(1)).unwrap();
        lossy.send(1, &ack(2)).unwrap();
        lossy.send(1, &ack(2)).unwrap();

        assert_eq!(inbox.drain(), vec![ack(1), ack(2)]);

        lossy.clear_interceptor();
        lossy.stats().reset();
        lossy.send(1, &ack(2)).unwrap();
        assert_eq!(lossy.stats().snapshot(), (1, 0, 1));
    }

    #[test]
    fn test_drop_rate_can_change_at_runtime() {
        let lossy = LossyTransport::passthrough(LocalTransport::new());
        let inbox = lossy.inner().register(1);

        lossy.set_drop_rate(1.0);
        lossy.send(1, &ack(1)).unwrap();
        lossy.set_drop_rate(0.0);
        lossy.send(1, &ack(2)).unwrap();

        assert_eq!(inbox.drain(), vec![ack(2)]);
        assert_eq!(lossy.stats().snapshot(), (2, 1, 1));
    }
}
