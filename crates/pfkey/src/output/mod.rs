//! Output formatting (JSON/text) for dump replies.
//!
//! Dump replies arrive as PF_KEY messages; [`SaRecord`] and
//! [`PolicyRecord`] lift the interesting parts out of a parsed
//! [`Envelope`](crate::key::Envelope) so they can be printed as text or
//! JSON.
//!
//! ```ignore
//! use pfkey::key::check_envelope;
//! use pfkey::output::{OutputFormat, OutputOptions, Printable, SaRecord};
//!
//! let env = check_envelope(&datagram)?;
//! if let Some(sa) = SaRecord::from_envelope(&env) {
//!     sa.print(&mut std::io::stdout(), OutputFormat::Json, &OutputOptions::default())?;
//! }
//! ```

pub mod formatting;
mod printable;

pub use printable::{PolicyRecord, RequestRecord, SaRecord};

use std::io::Write;

/// Knobs shared by every printer.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOptions {
    /// Show lifetimes and counters.
    pub details: bool,
    /// Indent JSON.
    pub pretty: bool,
}

/// How records are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// setkey-style lines.
    #[default]
    Text,
    /// One JSON value per record, or an array from [`print_all`].
    Json,
}

fn write_json<W: Write>(w: &mut W, json: &serde_json::Value, opts: &OutputOptions) -> std::io::Result<()> {
    if opts.pretty {
        serde_json::to_writer_pretty(&mut *w, json)?;
    } else {
        serde_json::to_writer(&mut *w, json)?;
    }
    writeln!(w)
}

/// A record that renders as text or JSON.
pub trait Printable {
    /// Text rendering, newline-terminated.
    fn print_text<W: Write>(&self, w: &mut W, opts: &OutputOptions) -> std::io::Result<()>;

    fn to_json(&self) -> serde_json::Value;

    fn print<W: Write>(
        &self,
        w: &mut W,
        format: OutputFormat,
        opts: &OutputOptions,
    ) -> std::io::Result<()> {
        match format {
            OutputFormat::Text => self.print_text(w, opts),
            OutputFormat::Json => write_json(w, &self.to_json(), opts),
        }
    }
}

/// Print a list of items, as one JSON array in JSON mode.
pub fn print_all<W: Write, T: Printable>(
    w: &mut W,
    items: &[T],
    format: OutputFormat,
    opts: &OutputOptions,
) -> std::io::Result<()> {
    match format {
        OutputFormat::Text => {
            for item in items {
                item.print_text(w, opts)?;
            }
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::Value::Array(items.iter().map(Printable::to_json).collect());
            write_json(w, &json, opts)
        }
    }
}
