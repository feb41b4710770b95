//! Locating `00 00 01 <id>` start codes within a scan window.

use log::warn;

/// A start code located by [`StartCodeScanner::scan()`].
#[derive(Debug, PartialEq, Eq)]
pub struct StartCode {
    /// the byte following the `00 00 01` prefix
    pub stream_id: u8,
    /// offset of the first prefix byte within the scanned window
    pub offset: usize,
}

/// Result of scanning a window for a start code.
#[derive(Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A complete `00 00 01 <id>` sequence was found.
    Found(StartCode),
    /// No complete start code before the end of the window; the caller must keep the window
    /// bytes from `retain_from` onward (a potential partial prefix) and refill.
    NeedMoreData {
        /// window offset of the first byte that must survive the refill
        retain_from: usize,
    },
}

/// Scanner that skips leading garbage until the next start code.
///
/// Streams produced by some recorders pad between packs with runs of zero bytes; that is a
/// known artifact, so the "missing start code" warning is raised once per contiguous garbage
/// run and re-armed when sync is regained, keeping the log readable without hiding real damage.
#[derive(Default)]
pub struct StartCodeScanner {
    in_garbage_run: bool,
}

impl StartCodeScanner {
    /// Create a scanner with the warning throttle armed.
    pub fn new() -> StartCodeScanner {
        Self::default()
    }

    /// Scan `window` for the first `00 00 01 <id>` sequence.  `position` is the absolute source
    /// offset of `window[0]`, used only for log messages.
    pub fn scan(&mut self, window: &[u8], position: u64) -> ScanOutcome {
        let mut i = 0;
        loop {
            if i + 4 > window.len() {
                return ScanOutcome::NeedMoreData { retain_from: i };
            }
            if window[i] == 0 && window[i + 1] == 0 && window[i + 2] == 1 {
                self.in_garbage_run = false;
                return ScanOutcome::Found(StartCode {
                    stream_id: window[i + 3],
                    offset: i,
                });
            }
            if !self.in_garbage_run {
                warn!("missing start code at {:#x}", position + i as u64);
                if window[i] == 0 && window[i + 1] == 0 && window[i + 2] == 0 {
                    warn!("incorrect zero-byte padding detected - ignored");
                }
                self.in_garbage_run = true;
            }
            i += 1;
        }
    }
}
