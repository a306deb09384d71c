//! Prepare watchdog timers
//!
//! Each match gets one timer while its prepare callback is outstanding. The
//! match owns the `Watchdog`; taking it out of the match is the only way to
//! release the transaction hold it carries.

use crate::event::{Mailbox, MemberEvent};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cancels an armed timer
pub trait TimerHandle: Send {
    fn cancel(&self);
}

/// Arms timers that post an event to a mailbox when they run out
pub trait TimerService: Send + Sync {
    fn arm(&self, after: Duration, mailbox: Mailbox, event: MemberEvent) -> Box<dyn TimerHandle>;
}

/// A running watchdog owned by a match
pub struct Watchdog {
    pub token: u64,
    handle: Box<dyn TimerHandle>,
}

impl Watchdog {
    pub fn new(token: u64, handle: Box<dyn TimerHandle>) -> Self {
        Self { token, handle }
    }

    /// Stop the timer; consuming the watchdog makes this happen at most once
    pub fn cancel(self) {
        self.handle.cancel();
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog").field("token", &self.token).finish()
    }
}

/// Timers backed by tokio tasks
#[derive(Debug, Default, Clone)]
pub struct TokioTimers;

struct TokioTimer(tokio::task::JoinHandle<()>);

impl TimerHandle for TokioTimer {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl TimerService for TokioTimers {
    fn arm(&self, after: Duration, mailbox: Mailbox, event: MemberEvent) -> Box<dyn TimerHandle> {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if mailbox.send(event).is_err() {
                tracing::debug!("Watchdog fired after member shut down");
            }
        });
        Box::new(TokioTimer(task))
    }
}

struct ManualTimer {
    after: Duration,
    mailbox: Mailbox,
    event: Option<MemberEvent>,
    cancelled: Arc<AtomicBool>,
}

impl ManualTimer {
    fn is_live(&self) -> bool {
        self.event.is_some() && !self.cancelled.load(Ordering::SeqCst)
    }
}

struct ManualHandle(Arc<AtomicBool>);

impl TimerHandle for ManualHandle {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Timers that only fire when told to
///
/// Clones share the same timer list, so a test can keep one clone and hand
/// another to the member.
#[derive(Clone, Default)]
pub struct ManualTimers {
    timers: Arc<Mutex<Vec<ManualTimer>>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers armed and neither fired nor cancelled
    pub fn armed(&self) -> usize {
        self.timers.lock().iter().filter(|t| t.is_live()).count()
    }

    /// Every timer ever armed, including cancelled ones
    pub fn total_armed(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn cancelled(&self) -> usize {
        self.timers
            .lock()
            .iter()
            .filter(|t| t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Fire every live timer in arming order, returning how many fired
    pub fn fire_all(&self) -> usize {
        let mut timers = self.timers.lock();
        let mut fired = 0;
        for timer in timers.iter_mut().filter(|t| t.is_live()) {
            if let Some(event) = timer.event.take()
                && timer.mailbox.send(event).is_ok()
            {
                fired += 1;
            }
        }
        fired
    }

    /// Fire live timers whose timeout is at most `elapsed`
    pub fn advance(&self, elapsed: Duration) -> usize {
        let mut timers = self.timers.lock();
        let mut fired = 0;
        for timer in timers
            .iter_mut()
            .filter(|t| t.is_live() && t.after <= elapsed)
        {
            if let Some(event) = timer.event.take()
                && timer.mailbox.send(event).is_ok()
            {
                fired += 1;
            }
        }
        fired
    }
}

impl TimerService for ManualTimers {
    fn arm(&self, after: Duration, mailbox: Mailbox, event: MemberEvent) -> Box<dyn TimerHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.timers.lock().push(ManualTimer {
            after,
            mailbox,
            event: Some(event),
            cancelled: cancelled.clone(),
        });
        Box::new(ManualHandle(cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MatchRef;
    use crate::transaction::{MatchId, XactHandle};
    use databus_common::{QueryId, TransactionId};
    use tokio::sync::mpsc;

    fn expiry(token: u64) -> MemberEvent {
        MemberEvent::WatchdogExpired {
            target: MatchRef {
                xact: XactHandle::new(TransactionId::new(), 1),
                query: QueryId(1),
                match_id: MatchId(1),
            },
            token,
        }
    }

    #[test]
    fn test_manual_fire_skips_cancelled() {
        let timers = ManualTimers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = timers.arm(Duration::from_secs(1), tx.clone(), expiry(1));
        let _second = timers.arm(Duration::from_secs(1), tx, expiry(2));
        first.cancel();

        assert_eq!(timers.armed(), 1);
        assert_eq!(timers.fire_all(), 1);
        assert_eq!(timers.fire_all(), 0);
        assert_eq!(timers.cancelled(), 1);

        match rx.try_recv().unwrap() {
            MemberEvent::WatchdogExpired { token, .. } => assert_eq!(token, 2),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_manual_advance_respects_timeout() {
        let timers = ManualTimers::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let _short = timers.arm(Duration::from_millis(10), tx.clone(), expiry(1));
        let _long = timers.arm(Duration::from_secs(10), tx, expiry(2));

        assert_eq!(timers.advance(Duration::from_millis(50)), 1);
        assert_eq!(timers.armed(), 1);
        assert_eq!(timers.total_armed(), 2);
    }

    #[tokio::test]
    async fn test_tokio_timer_posts_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = TokioTimers.arm(Duration::from_millis(5), tx, expiry(9));
        match rx.recv().await {
            Some(MemberEvent::WatchdogExpired { token, .. }) => assert_eq!(token, 9),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tokio_timer_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = TokioTimers.arm(Duration::from_millis(20), tx, expiry(1));
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
