//! The multiplexing loop.
//!
//! One thread drives every connector of a run. Each pass:
//!
//! ```text
//!   ┌─► exit = exit_condition()          evaluated before polling, so a
//!   │                                    final drain pass always happens
//!   │   poll(fds, timeout)               Always-ready endpoints force a
//!   │                                    zero timeout; NotReady are skipped
//!   │   step every ready reader          Finished → drop from active set
//!   │   step every ready writer          Finished → drop from active set
//!   │   open every unopened writer       lazy FIFO writer open
//!   │
//!   └── until (no readers ∨ none ready) ∧ (no writers ∨ none ready) ∧ exit
//! ```
//!
//! The predicate answers with a [`LoopSignal`]; a plain `bool` converts to
//! `Continue`/`Exit`. [`LoopSignal::Abort`] ends the loop at once without
//! waiting for the connectors to go idle.
//!
//! Every connector is closed exactly once when the loop ends, whether it
//! ends normally or with an error. Step errors are fatal to the run.

use crate::connector::{Step, StreamConnector};
use crate::error::Result;
use crate::stream::PollHandle;
use std::io;
use std::time::Duration;
use tracing::{debug, trace, warn};

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
const WRITE_EVENTS: libc::c_short =
    libc::POLLOUT | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

/// What the exit predicate tells the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    /// Keep going.
    Continue,
    /// Finish once no connector made progress on a pass.
    Exit,
    /// Finish now, even if data is still flowing.
    Abort,
}

impl From<bool> for LoopSignal {
    fn from(exit: bool) -> Self {
        if exit { Self::Exit } else { Self::Continue }
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Completed poll passes.
    pub passes: usize,
    /// Bytes moved by read connectors.
    pub bytes_read: usize,
    /// Bytes moved by write connectors.
    pub bytes_written: usize,
}

/// Drives `readers` and `writers` until they are idle and `exit_condition`
/// holds.
///
/// `exit_condition` is re-evaluated at least every `poll_timeout`; an error
/// from it aborts the loop like a step error.
pub fn select_loop<F, S>(
    mut exit_condition: F,
    mut readers: Vec<StreamConnector>,
    mut writers: Vec<StreamConnector>,
    poll_timeout: Duration,
) -> Result<LoopStats>
where
    F: FnMut() -> Result<S>,
    S: Into<LoopSignal>,
{
    let mut stats = LoopStats::default();
    let result = run(
        &mut exit_condition,
        &mut readers,
        &mut writers,
        poll_timeout,
        &mut stats,
    );

    let mut close_error = None;
    for connector in readers.iter_mut().chain(writers.iter_mut()) {
        if let Err(e) = connector.close() {
            warn!("Failed to close connector: {}", e);
            close_error.get_or_insert(e);
        }
    }

    result?;
    if let Some(e) = close_error {
        return Err(e);
    }
    debug!(
        passes = stats.passes,
        bytes_read = stats.bytes_read,
        bytes_written = stats.bytes_written,
        "Select loop finished"
    );
    Ok(stats)
}

fn run<F, S>(
    exit_condition: &mut F,
    readers: &mut Vec<StreamConnector>,
    writers: &mut Vec<StreamConnector>,
    poll_timeout: Duration,
    stats: &mut LoopStats,
) -> Result<()>
where
    F: FnMut() -> Result<S>,
    S: Into<LoopSignal>,
{
    let timeout_ms = i32::try_from(poll_timeout.as_millis()).unwrap_or(i32::MAX);

    loop {
        let exit = match exit_condition()?.into() {
            LoopSignal::Continue => false,
            LoopSignal::Exit => true,
            LoopSignal::Abort => {
                debug!(
                    readers = readers.len(),
                    writers = writers.len(),
                    "Select loop aborted"
                );
                return Ok(());
            }
        };

        let (read_ready, write_ready) = ready_set(readers, writers, timeout_ms)?;
        stats.passes += 1;

        let mut finished_readers = Vec::new();
        for &i in &read_ready {
            match readers[i].step()? {
                Step::Progress(n) => stats.bytes_read += n,
                Step::Finished => finished_readers.push(i),
            }
        }

        let mut finished_writers = Vec::new();
        for &i in &write_ready {
            match writers[i].step()? {
                Step::Progress(n) => stats.bytes_written += n,
                Step::Finished => finished_writers.push(i),
            }
        }

        remove_indices(readers, &finished_readers);
        remove_indices(writers, &finished_writers);

        for writer in writers.iter_mut().filter(|w| !w.is_open()) {
            writer.open()?;
        }

        let empty = (readers.is_empty() || read_ready.is_empty())
            && (writers.is_empty() || write_ready.is_empty());
        trace!(
            pass = stats.passes,
            readers = readers.len(),
            writers = writers.len(),
            empty,
            exit,
            "Select loop pass"
        );
        if empty && exit {
            return Ok(());
        }
    }
}

/// Waits for readiness and returns the indices of ready readers and writers.
fn ready_set(
    readers: &[StreamConnector],
    writers: &[StreamConnector],
    timeout_ms: i32,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut read_ready = Vec::new();
    let mut write_ready = Vec::new();
    let mut pollfds = Vec::new();
    // (is_reader, index) for each entry of `pollfds`.
    let mut owners = Vec::new();

    for (i, connector) in readers.iter().enumerate() {
        register(connector, (true, i), &mut pollfds, &mut owners, &mut read_ready);
    }
    for (i, connector) in writers.iter().enumerate() {
        register(connector, (false, i), &mut pollfds, &mut owners, &mut write_ready);
    }

    // Descriptor-less endpoints are ready now; only check descriptors
    // without waiting.
    let timeout = if read_ready.is_empty() && write_ready.is_empty() {
        timeout_ms
    } else {
        0
    };

    // SAFETY: `pollfds` is a live, exclusively borrowed buffer of exactly
    // `pollfds.len()` entries; poll only writes their `revents`.
    let result = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout,
        )
    };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok((read_ready, write_ready));
        }
        return Err(err.into());
    }

    for (pollfd, &(is_reader, i)) in pollfds.iter().zip(&owners) {
        let wanted = if pollfd.events == libc::POLLOUT {
            WRITE_EVENTS
        } else {
            READ_EVENTS
        };
        if pollfd.revents & wanted == 0 {
            continue;
        }
        if is_reader {
            read_ready.push(i);
        } else {
            write_ready.push(i);
        }
    }
    Ok((read_ready, write_ready))
}

/// Adds one connector to the poll set, or straight to `ready` when it has no
/// descriptor. Connectors holding undelivered bytes wait for `POLLOUT`.
fn register(
    connector: &StreamConnector,
    owner: (bool, usize),
    pollfds: &mut Vec<libc::pollfd>,
    owners: &mut Vec<(bool, usize)>,
    ready: &mut Vec<usize>,
) {
    match connector.poll_handle() {
        PollHandle::Fd(fd) => {
            let events = if connector.waits_on_output() {
                libc::POLLOUT
            } else {
                libc::POLLIN
            };
            pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
            owners.push(owner);
        }
        PollHandle::Always => ready.push(owner.1),
        PollHandle::NotReady => {}
    }
}

fn remove_indices(connectors: &mut Vec<StreamConnector>, indices: &[usize]) {
    if indices.is_empty() {
        return;
    }
    let mut i = 0;
    connectors.retain(|_| {
        let keep = !indices.contains(&i);
        i += 1;
        keep
    });
}
