// src/comm.rs
//
// Point-to-point messaging substrate.
//
// The clustering core only needs non-blocking sends, a non-blocking probe for
// arrived messages and a blocking receive that gives up after a timeout.
// `ChannelComm` provides that between threads of one process, one thread per
// rank; a distributed transport only has to implement `Comm`.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};

use crate::error::CommError;

pub trait Comm<M> {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Send without waiting for the receiver.
    fn send(&self, to: usize, msg: M) -> Result<(), CommError>;

    /// Next arrived message as `(source, message)`, if any.
    fn try_recv(&self) -> Result<Option<(usize, M)>, CommError>;

    /// Wait for the next message. Fails with `CommError::Timeout` when nothing
    /// arrives in time.
    fn recv(&self) -> Result<(usize, M), CommError>;
}

/// In-process communicator: one unbounded channel per rank.
///
/// Every call to [`ChannelComm::world`] creates an independent set of channels,
/// so a second world acts as a duplicated communicator isolated from the first.
#[derive(Debug)]
pub struct ChannelComm<M> {
    rank: usize,
    senders: Vec<Sender<(usize, M)>>,
    receiver: Receiver<(usize, M)>,
    timeout: Duration,
}

impl<M> ChannelComm<M> {
    /// Build a congruent set of `n` communicators, index = rank.
    pub fn world(n: usize, timeout: Duration) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..n).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| Self {
                rank,
                senders: senders.clone(),
                receiver,
                timeout,
            })
            .collect()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl<M> Comm<M> for ChannelComm<M> {
    #[inline]
    fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, to: usize, msg: M) -> Result<(), CommError> {
        let tx = self.senders.get(to).ok_or(CommError::InvalidRank {
            rank: to,
            size: self.senders.len(),
        })?;
        tx.send((self.rank, msg))
            .map_err(|_| CommError::Disconnected { to })
    }

    fn try_recv(&self) -> Result<Option<(usize, M)>, CommError> {
        match self.receiver.try_recv() {
            Ok(m) => Ok(Some(m)),
            Err(TryRecvError::Empty) => Ok(None),
            // Unreachable while this rank holds a sender to itself.
            Err(TryRecvError::Disconnected) => Err(CommError::Disconnected { to: self.rank }),
        }
    }

    fn recv(&self) -> Result<(usize, M), CommError> {
        match self.receiver.recv_timeout(self.timeout) {
            Ok(m) => Ok(m),
            Err(RecvTimeoutError::Timeout) => Err(CommError::Timeout {
                rank: self.rank,
                waited: self.timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(CommError::Disconnected { to: self.rank }),
        }
    }
}

/// Run `f` once per communicator, each on its own scoped thread, and collect the
/// results in rank order.
pub fn run_on_ranks<C, T, F>(comms: Vec<C>, f: F) -> Vec<T>
where
    C: Send,
    T: Send,
    F: Fn(C) -> T + Sync,
{
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(v) => v,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_exchange_between_threads() {
        let comms = ChannelComm::<u64>::world(4, Duration::from_secs(5));
        let got = run_on_ranks(comms, |comm| {
            let n = comm.size();
            let next = (comm.rank() + 1) % n;
            comm.send(next, comm.rank() as u64 * 10).unwrap();
            comm.recv().unwrap()
        });
        assert_eq!(got, vec![(3, 30), (0, 0), (1, 10), (2, 20)]);
    }

    #[test]
    fn try_recv_is_non_blocking_and_recv_times_out() {
        let comms = ChannelComm::<u8>::world(1, Duration::from_millis(20));
        let c = &comms[0];
        assert!(c.try_recv().unwrap().is_none());
        c.send(0, 7).unwrap();
        assert_eq!(c.try_recv().unwrap(), Some((0, 7)));
        assert!(matches!(c.recv(), Err(CommError::Timeout { rank: 0, .. })));
        assert!(matches!(
            c.send(3, 1),
            Err(CommError::InvalidRank { rank: 3, size: 1 })
        ));
    }

    #[test]
    fn timeout_can_be_changed_per_rank() {
        let mut comms = ChannelComm::<u8>::world(2, Duration::from_secs(60));
        comms[1].set_timeout(Duration::from_millis(10));
        assert_eq!(comms[0].timeout(), Duration::from_secs(60));
        assert_eq!(comms[1].timeout(), Duration::from_millis(10));
        match comms[1].recv() {
            Err(CommError::Timeout { rank: 1, waited }) => {
                assert_eq!(waited, Duration::from_millis(10))
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[test]
    fn separate_worlds_do_not_share_traffic() {
        let a = ChannelComm::<u8>::world(2, Duration::from_millis(20));
        let b = ChannelComm::<u8>::world(2, Duration::from_millis(20));
        a[0].send(1, 1).unwrap();
        assert!(b[1].try_recv().unwrap().is_none());
        assert_eq!(a[1].try_recv().unwrap(), Some((0, 1)));
    }
}
