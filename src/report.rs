use std::fmt;
use std::io::Write;

/// Line oriented progress report of a run.
///
/// The report is best effort. A failed write is logged once and later lines are dropped, it
/// never fails the run.
#[derive(Debug)]
pub struct Progress<W> {
    out: W,
    broken: bool,
}

impl<W: Write> Progress<W> {
    pub fn new(out: W) -> Self {
        Self { out, broken: false }
    }

    pub fn line(&mut self, line: impl fmt::Display) {
        if self.broken {
            return;
        }
        if let Err(err) = writeln!(self.out, "{line}").and_then(|()| self.out.flush()) {
            tracing::warn!(%err, "failed to write progress, further output is dropped");
            self.broken = true;
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
