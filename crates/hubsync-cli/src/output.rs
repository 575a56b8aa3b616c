//! Shared output layer: human text or stable JSON for every command.

use serde::Serialize;
use std::io::{self, Write};

/// Shared width for human separators.
pub const RULE_WIDTH: usize = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Write a section heading followed by a separator.
pub fn section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    writeln!(w, "{:-<width$}", "", width = RULE_WIDTH)
}

/// Render `value` as pretty JSON, or with `human` otherwise.
pub fn render<T, F>(mode: OutputMode, value: &T, human: F) -> anyhow::Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce(&T, &mut dyn Write) -> io::Result<()>,
{
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if mode.is_json() {
        serde_json::to_writer_pretty(&mut out, value)?;
        writeln!(out)?;
    } else {
        human(value, &mut out)?;
    }
    out.flush()?;
    Ok(())
}

/// Render a list of rows, with a heading and one line per row for humans.
pub fn render_list<T, F>(mode: OutputMode, heading: &str, rows: &[T], line: F) -> anyhow::Result<()>
where
    T: Serialize,
    F: Fn(&T, &mut dyn Write) -> io::Result<()>,
{
    render(mode, rows, |rows, w| {
        section(w, heading)?;
        if rows.is_empty() {
            writeln!(w, "(none)")?;
        }
        for row in rows {
            line(row, w)?;
        }
        Ok(())
    })
}
