use anyhow::{Context, Result};
use std::io::{self, Stdout, Write};
use tracing::{info, warn};

use crate::config::{DisplaySettings, RendererKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    First,
    Second,
}

impl Line {
    pub fn number(self) -> u8 {
        match self {
            Line::First => 1,
            Line::Second => 2,
        }
    }
}

/// A two-line fixed-width character display.
///
/// Callers hand over text already fitted to the display width.
pub trait Renderer: Send {
    fn write_line(&mut self, text: &str, line: Line) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

/// Opens the configured renderer. Failure here is fatal: there is no panel
/// without a display.
pub fn open(settings: &DisplaySettings) -> Result<Box<dyn Renderer>> {
    match settings.renderer {
        RendererKind::Terminal => {
            if !crate::utils::enable_panel_console() {
                warn!("Console rejected UTF-8/VT mode, the panel may render garbled");
            }
            Ok(Box::new(TerminalRenderer::open(io::stdout(), settings.width)?))
        }
        RendererKind::Log => Ok(Box::new(LogRenderer::default())),
    }
}

/// Draws the panel as a boxed two-line area at the top of the terminal.
pub struct TerminalRenderer<W: Write + Send = Stdout> {
    out: W,
    width: usize,
}

impl<W: Write + Send> TerminalRenderer<W> {
    pub fn open(mut out: W, width: usize) -> Result<Self> {
        let border = "─".repeat(width);
        write!(out, "\x1b[2J\x1b[?25l\x1b[1;1H┌{border}┐\x1b[4;1H└{border}┘")
            .and_then(|()| out.flush())
            .context("Failed to initialise terminal display")?;
        Ok(Self { out, width })
    }
}

impl<W: Write + Send> Renderer for TerminalRenderer<W> {
    fn write_line(&mut self, text: &str, line: Line) -> Result<()> {
        let row = line.number() + 1;
        let col = self.width + 2;
        write!(self.out, "\x1b[{row};1H│{text}\x1b[{row};{col}H│")?;
        self.out.flush()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        write!(self.out, "\x1b[2J\x1b[1;1H\x1b[?25h")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Headless renderer: logs each line when its content changes.
#[derive(Debug, Default)]
pub struct LogRenderer {
    lines: [String; 2],
}

impl Renderer for LogRenderer {
    fn write_line(&mut self, text: &str, line: Line) -> Result<()> {
        let slot = &mut self.lines[usize::from(line.number() - 1)];
        if *slot != text {
            info!("[LINE {}] {}", line.number(), text);
            text.clone_into(slot);
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.lines = Default::default();
        info!("[PANEL] cleared");
        Ok(())
    }
}
