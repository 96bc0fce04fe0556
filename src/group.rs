//! Connection group: drives many chunk connections from one task.
//!
//! Every member is stepped independently: a step sends its pending request
//! or performs one read, and is bounded by the idle timeout. Steps complete
//! in whatever order the sockets become ready. A one-second ticker keeps
//! progress flowing and cancellation responsive while nothing is readable.

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MgetError, Result};

pub const TICK: Duration = Duration::from_secs(1);

/// Result of one member step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Made progress (payload bytes written), keep going.
    Continue(u64),
    /// This member's work is complete.
    Finished(u64),
    /// The peer went away before the work was complete.
    Closed,
}

#[allow(async_fn_in_trait)]
pub trait Member {
    /// True while a request still has to be sent.
    fn wants_write(&self) -> bool;

    async fn on_writable(&mut self) -> Result<Flow>;

    /// Performs one read and handles whatever it delivered.
    async fn on_readable(&mut self) -> Result<Flow>;
}

#[derive(Debug)]
pub enum GroupEvent<'a, M> {
    Progress { member: &'a M, bytes: u64 },
    Finished { member: &'a M },
    Closed { member: &'a M },
    Failed { member: &'a M, error: MgetError },
    Tick { live: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GroupOutcome {
    pub finished: usize,
    pub closed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

async fn step<M: Member>(member: &mut M, idle: Duration) -> (&mut M, Result<Flow>) {
    let fut = async {
        if member.wants_write() {
            member.on_writable().await
        } else {
            member.on_readable().await
        }
    };
    let result = match tokio::time::timeout(idle, fut).await {
        Ok(result) => result,
        Err(_) => Err(MgetError::IdleTimeout(idle.as_secs())),
    };
    (member, result)
}

/// Runs every member to completion or failure, or until `cancel` fires.
///
/// `hook` sees each event in turn; an error from it stops the group.
pub async fn run<M, H>(
    members: &mut [M],
    cancel: &CancellationToken,
    idle: Duration,
    mut hook: H,
) -> Result<GroupOutcome>
where
    M: Member,
    H: FnMut(GroupEvent<'_, M>) -> Result<()>,
{
    let mut outcome = GroupOutcome::default();
    let mut live = members.len();
    let mut pending = FuturesUnordered::new();
    for member in members.iter_mut() {
        pending.push(step(member, idle));
    }

    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    while live > 0 {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("connection group cancelled with {live} live members");
                outcome.cancelled = true;
                break;
            }
            Some((member, result)) = pending.next() => match result {
                Ok(Flow::Continue(bytes)) => {
                    hook(GroupEvent::Progress { member: &*member, bytes })?;
                    pending.push(step(member, idle));
                }
                Ok(Flow::Finished(bytes)) => {
                    if bytes > 0 {
                        hook(GroupEvent::Progress { member: &*member, bytes })?;
                    }
                    hook(GroupEvent::Finished { member: &*member })?;
                    outcome.finished += 1;
                    live -= 1;
                }
                Ok(Flow::Closed) => {
                    hook(GroupEvent::Closed { member: &*member })?;
                    outcome.closed += 1;
                    live -= 1;
                }
                Err(error) => {
                    warn!("connection dropped from group: {error}");
                    hook(GroupEvent::Failed { member: &*member, error })?;
                    outcome.failed += 1;
                    live -= 1;
                }
            },
            _ = ticker.tick() => {
                hook(GroupEvent::Tick { live })?;
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted member: yields its flows in order, sleeping before each.
    struct Scripted {
        id: usize,
        request_sent: bool,
        script: Vec<(u64, Result<Flow>)>,
    }

    impl Scripted {
        fn new(id: usize, script: Vec<(u64, Result<Flow>)>) -> Self {
            Self {
                id,
                request_sent: false,
                script,
            }
        }
    }

    impl Member for Scripted {
        fn wants_write(&self) -> bool {
            !self.request_sent
        }

        async fn on_writable(&mut self) -> Result<Flow> {
            self.request_sent = true;
            Ok(Flow::Continue(0))
        }

        async fn on_readable(&mut self) -> Result<Flow> {
            if self.script.is_empty() {
                std::future::pending::<()>().await;
            }
            let (delay_ms, flow) = self.script.remove(0);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            flow
        }
    }

    #[tokio::test]
    async fn runs_until_every_member_is_done() {
        let mut members = vec![
            Scripted::new(0, vec![(5, Ok(Flow::Continue(10))), (5, Ok(Flow::Finished(5)))]),
            Scripted::new(1, vec![(1, Ok(Flow::Closed))]),
            Scripted::new(2, vec![(2, Err(MgetError::Incomplete { remaining: 3 }))]),
        ];
        let cancel = CancellationToken::new();
        let mut progress = [0u64; 3];
        let mut closed = Vec::new();
        let mut failed = Vec::new();
        let outcome = run(&mut members, &cancel, Duration::from_secs(5), |event| {
            match event {
                GroupEvent::Progress { member, bytes } => progress[member.id] += bytes,
                GroupEvent::Closed { member } => closed.push(member.id),
                GroupEvent::Failed { member, .. } => failed.push(member.id),
                GroupEvent::Finished { .. } | GroupEvent::Tick { .. } => {}
            }
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(
            outcome,
            GroupOutcome {
                finished: 1,
                closed: 1,
                failed: 1,
                cancelled: false
            }
        );
        assert_eq!(progress, [15, 0, 0]);
        assert_eq!(closed, vec![1]);
        assert_eq!(failed, vec![2]);
    }

    #[tokio::test]
    async fn stalled_member_hits_idle_timeout() {
        let mut members = vec![Scripted::new(0, vec![])];
        let cancel = CancellationToken::new();
        let mut failures = Vec::new();
        let outcome = run(&mut members, &cancel, Duration::from_millis(50), |event| {
            if let GroupEvent::Failed { error, .. } = event {
                failures.push(error);
            }
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(outcome.failed, 1);
        assert!(matches!(failures[0], MgetError::IdleTimeout(_)));
    }

    #[tokio::test]
    async fn cancellation_is_prompt() {
        let mut members = vec![Scripted::new(0, vec![]), Scripted::new(1, vec![])];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = run(&mut members, &cancel, Duration::from_secs(60), |_| Ok(()))
            .await
            .unwrap();
        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn hook_error_stops_the_group() {
        let mut members = vec![Scripted::new(0, vec![(1, Ok(Flow::Continue(1)))])];
        let cancel = CancellationToken::new();
        let result = run(&mut members, &cancel, Duration::from_secs(5), |event| match event {
            GroupEvent::Progress { bytes, .. } if bytes > 0 => {
                Err(MgetError::Internal("disk full".into()))
            }
            _ => Ok(()),
        })
        .await;
        assert!(matches!(result, Err(MgetError::Internal(_))));
    }

    #[tokio::test]
    async fn ticks_while_idle() {
        let mut members = vec![Scripted::new(0, vec![(1200, Ok(Flow::Finished(0)))])];
        let cancel = CancellationToken::new();
        let mut ticks = 0;
        run(&mut members, &cancel, Duration::from_secs(5), |event| {
            if let GroupEvent::Tick { live } = event {
                assert_eq!(live, 1);
                ticks += 1;
            }
            Ok(())
        })
        .await
        .unwrap();
        assert!(ticks >= 1);
    }
}
