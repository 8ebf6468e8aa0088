//! The process-wide standard output channel.
//!
//! Script output goes through [`write`]. While an [`OutputRedirect`] is
//! active on the writing thread, text lands in its buffer instead of stdout.
//! Redirects nest with stack discipline and are serialized across threads:
//! a second thread's `begin` waits until the first thread's outermost
//! redirect ends.

use std::io::Write as _;
use std::thread::{self, ThreadId};

use parking_lot::{const_mutex, const_reentrant_mutex, Mutex, ReentrantMutex, ReentrantMutexGuard};

struct Capture {
    owner: ThreadId,
    buffer: String,
}

static GATE: ReentrantMutex<()> = const_reentrant_mutex(());
static CAPTURES: Mutex<Vec<Capture>> = const_mutex(Vec::new());

/// Write text to the current output channel.
pub fn write(text: &str) {
    {
        let mut captures = CAPTURES.lock();
        let me = thread::current().id();
        if let Some(capture) = captures.last_mut().filter(|c| c.owner == me) {
            capture.buffer.push_str(text);
            return;
        }
    }
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

/// Whether output from the current thread is being captured.
pub fn is_redirected() -> bool {
    let me = thread::current().id();
    CAPTURES.lock().last().is_some_and(|c| c.owner == me)
}

/// Scoped capture of the output channel. Dropping the guard without calling
/// [`finish`](Self::finish) discards the captured text and still restores
/// the previous channel.
pub struct OutputRedirect {
    depth: usize,
    done: bool,
    // Held for the whole redirect; released last.
    _gate: ReentrantMutexGuard<'static, ()>,
}

impl OutputRedirect {
    pub fn begin() -> Self {
        let gate = GATE.lock();
        let mut captures = CAPTURES.lock();
        captures.push(Capture {
            owner: thread::current().id(),
            buffer: String::new(),
        });
        let depth = captures.len();
        log::trace!("output redirected (depth {depth})");
        Self {
            depth,
            done: false,
            _gate: gate,
        }
    }

    /// End the redirect and return everything written while it was active.
    pub fn finish(mut self) -> String {
        self.restore()
    }

    fn restore(&mut self) -> String {
        self.done = true;
        let mut captures = CAPTURES.lock();
        // Inner redirects leaked past this one are unwound with it.
        while captures.len() > self.depth {
            captures.pop();
        }
        let text = if captures.len() == self.depth {
            captures.pop().map(|c| c.buffer).unwrap_or_default()
        } else {
            String::new()
        };
        log::trace!("output restored (depth {})", self.depth);
        text
    }
}

impl Drop for OutputRedirect {
    fn drop(&mut self) {
        if !self.done {
            self.restore();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn captures_and_restores() {
        let redirect = OutputRedirect::begin();
        assert!(is_redirected());
        write("hello ");
        write("world");
        assert_eq!(redirect.finish(), "hello world");
        assert!(!is_redirected());
    }

    #[test]
    fn nested_redirects_are_stacked() {
        let outer = OutputRedirect::begin();
        write("a");
        let inner = OutputRedirect::begin();
        write("b");
        assert_eq!(inner.finish(), "b");
        write("c");
        assert_eq!(outer.finish(), "ac");
    }

    #[test]
    fn restored_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _redirect = OutputRedirect::begin();
            write("lost");
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(!is_redirected());
        let redirect = OutputRedirect::begin();
        write("fresh");
        assert_eq!(redirect.finish(), "fresh");
    }

    #[test]
    fn other_threads_wait_for_the_gate() {
        let redirect = OutputRedirect::begin();
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let inner = OutputRedirect::begin();
            write("second");
            tx.send(inner.finish()).unwrap();
        });
        // The other thread cannot start capturing while we hold the gate
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        write("first");
        assert_eq!(redirect.finish(), "first");
        assert_eq!(rx.recv().unwrap(), "second");
        handle.join().unwrap();
    }
}
