//! Two-line panel state machine.
//!
//! Line one is the wall clock. Line two either shows the down indicator
//! (while the reachability gate is DOWN) or rotates through the rotatable
//! entries of the status document, one step per shift interval.

use chrono::{DateTime, Local};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::config::DisplaySettings;
use crate::models::{Entry, StatusDocument};
use crate::renderer::{Line, Renderer};
use crate::store::StatusStore;
use crate::utils::fit_line;

/// `03:04:05, Mon 07`: sixteen characters.
const CLOCK_FORMAT: &str = "%I:%M:%S, %a %d";

/// Index into the rotatable entries. Lives only in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationCursor(usize);

impl RotationCursor {
    pub fn advance(&mut self, len: usize) {
        if len > 0 {
            self.0 = (self.0 + 1) % len;
        }
    }

    pub fn position(self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            self.0 % len
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub first: String,
    pub second: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupted,
    RendererFailed,
}

pub struct DisplayEngine {
    cursor: RotationCursor,
    last_shift: Instant,
    link_up: bool,
    shift_interval: Duration,
    tick: Duration,
    width: usize,
    down_text: String,
}

impl DisplayEngine {
    /// Starts in the link-down state with the cursor at the first entry.
    pub fn new(settings: &DisplaySettings, now: Instant) -> Self {
        Self {
            cursor: RotationCursor::default(),
            last_shift: now,
            link_up: false,
            shift_interval: settings.shift_interval(),
            tick: settings.tick(),
            width: settings.width,
            down_text: settings.down_text.clone(),
        }
    }

    pub fn cursor(&self) -> RotationCursor {
        self.cursor
    }

    /// Advances the state machine to `now` and builds the two lines for `doc`.
    pub fn frame(&mut self, doc: &StatusDocument, now: Instant, wall: DateTime<Local>) -> Frame {
        let first = fit_line(&wall.format(CLOCK_FORMAT).to_string(), self.width);

        if !doc.link_up() {
            self.link_up = false;
            return Frame {
                first,
                second: fit_line(&self.down_text, self.width),
            };
        }

        let entries = doc.entries();
        if !self.link_up {
            // Resume where rotation stopped, with a full interval on screen.
            self.link_up = true;
            self.last_shift = now;
        } else if now.duration_since(self.last_shift) >= self.shift_interval {
            self.cursor.advance(entries.len());
            self.last_shift = now;
        }

        let second = entries
            .get(self.cursor.position(entries.len()))
            .map(describe)
            .unwrap_or_default();
        Frame {
            first,
            second: fit_line(&second, self.width),
        }
    }

    /// Renders on every tick until `shutdown` resolves or the renderer fails,
    /// then clears the display.
    pub async fn run<R, S>(mut self, store: &StatusStore, renderer: &mut R, shutdown: S) -> ShutdownReason
    where
        R: Renderer + ?Sized,
        S: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Display engine active, tick {}ms", self.tick.as_millis());
        let reason = loop {
            tokio::select! {
                () = &mut shutdown => break ShutdownReason::Interrupted,
                _ = ticker.tick() => {
                    let doc = store.snapshot().await;
                    let frame = self.frame(&doc, Instant::now(), Local::now());
                    let written = renderer
                        .write_line(&frame.first, Line::First)
                        .and_then(|()| renderer.write_line(&frame.second, Line::Second));
                    if let Err(e) = written {
                        error!("Display write failed: {:#}", e);
                        break ShutdownReason::RendererFailed;
                    }
                }
            }
        };

        if let Err(e) = renderer.clear() {
            error!("Failed to clear display: {:#}", e);
        }
        reason
    }
}

fn describe(entry: &Entry) -> String {
    match entry {
        Entry::Speed(s) => format!("\u{25B2}{:.2} \u{25BC}{:.2} MB", s.download, s.upload),
        Entry::Target { name, target } => format!("{} \u{2192} {}", name, target.status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PanelConfig;
    use crate::models::{CycleOutcome, SpeedSample, Status};
    use chrono::TimeZone;

    fn wall() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 8, 15, 4, 5).unwrap()
    }

    fn doc(link: Status) -> StatusDocument {
        let mut doc = StatusDocument::default_for(&PanelConfig::default());
        CycleOutcome {
            gate: link,
            services: vec![
                ("NAS_GOPI".into(), Status::Up),
                ("NAS_GOKU".into(), Status::Down),
                ("PLEX".into(), Status::Up),
            ],
            speed: Some(SpeedSample::from_bits_per_second(100_000_000.0, 20_000_000.0)),
        }
        .apply_to(&mut doc);
        doc
    }

    fn engine(start: Instant) -> DisplayEngine {
        DisplayEngine::new(&DisplaySettings::default(), start)
    }

    const SHIFT: Duration = Duration::from_secs(5);

    #[test]
    fn clock_line_is_sixteen_characters() {
        let start = Instant::now();
        let frame = engine(start).frame(&doc(Status::Up), start, wall());
        assert_eq!(frame.first, "03:04:05, Mon 08");
    }

    #[test]
    fn starts_link_down_and_shows_indicator() {
        let start = Instant::now();
        let mut engine = engine(start);
        let frame = engine.frame(&StatusDocument::default_for(&PanelConfig::default()), start, wall());
        assert_eq!(frame.second, "----NET DOWN----");
        assert_eq!(engine.cursor(), RotationCursor(0));
    }

    #[test]
    fn renders_target_and_speed_entries() {
        let start = Instant::now();
        let mut engine = engine(start);
        let up = doc(Status::Up);

        let seen: Vec<String> = (0..4)
            .map(|i| engine.frame(&up, start + SHIFT * i, wall()).second)
            .collect();
        assert_eq!(
            seen,
            [
                "NAS_GOPI → UP   ",
                "NAS_GOKU → DOWN ",
                "PLEX → UP       ",
                "▲12.50 ▼2.50 MB ",
            ]
        );
    }

    #[test]
    fn speed_line_keeps_two_decimals() {
        let whole = Entry::Speed(SpeedSample { download: 12.0, upload: 0.0 });
        assert_eq!(describe(&whole), "▲12.00 ▼0.00 MB");
        let fine = Entry::Speed(SpeedSample { download: 11.68, upload: 2.5 });
        assert_eq!(describe(&fine), "▲11.68 ▼2.50 MB");
    }

    #[test]
    fn visits_every_entry_once_per_cycle_and_never_the_gate() {
        let start = Instant::now();
        let mut engine = engine(start);
        let up = doc(Status::Up);
        let n = up.entries().len() as u32;

        let mut positions = Vec::new();
        for tick in 0..(n * 10) {
            // Two render ticks per second.
            let now = start + Duration::from_millis(500) * tick;
            let frame = engine.frame(&up, now, wall());
            assert!(!frame.second.starts_with("INTERNET →"));
            if positions.last() != Some(&engine.cursor()) {
                positions.push(engine.cursor());
            }
        }
        let visited: Vec<usize> = positions.iter().map(|c| c.position(n as usize)).collect();
        assert_eq!(visited, [0, 1, 2, 3]);
    }

    #[test]
    fn does_not_shift_before_interval_elapses() {
        let start = Instant::now();
        let mut engine = engine(start);
        let up = doc(Status::Up);
        engine.frame(&up, start, wall());
        engine.frame(&up, start + Duration::from_millis(4_999), wall());
        assert_eq!(engine.cursor(), RotationCursor(0));
        engine.frame(&up, start + SHIFT, wall());
        assert_eq!(engine.cursor(), RotationCursor(1));
    }

    #[test]
    fn link_down_freezes_cursor_and_resumes_in_place() {
        let start = Instant::now();
        let mut engine = engine(start);
        let up = doc(Status::Up);
        let down = doc(Status::Down);

        for i in 0..3 {
            engine.frame(&up, start + SHIFT * i, wall());
        }
        assert_eq!(engine.cursor(), RotationCursor(2));

        let frame = engine.frame(&down, start + SHIFT * 3, wall());
        assert_eq!(frame.second, "----NET DOWN----");
        engine.frame(&down, start + SHIFT * 8, wall());
        assert_eq!(engine.cursor(), RotationCursor(2));

        let frame = engine.frame(&up, start + SHIFT * 9, wall());
        assert_eq!(engine.cursor(), RotationCursor(2));
        assert_eq!(frame.second, "PLEX → UP       ");

        engine.frame(&up, start + SHIFT * 10, wall());
        assert_eq!(engine.cursor(), RotationCursor(3));
    }

    #[test]
    fn cursor_wraps_at_the_last_entry() {
        let mut cursor = RotationCursor::default();
        for _ in 0..4 {
            cursor.advance(4);
        }
        assert_eq!(cursor, RotationCursor(0));
        assert_eq!(RotationCursor(6).position(4), 2);
        assert_eq!(RotationCursor(3).position(0), 0);
    }

    #[derive(Default)]
    struct RecordingRenderer {
        writes: Vec<(Line, String)>,
        cleared: bool,
        fail_after: Option<usize>,
    }

    impl Renderer for RecordingRenderer {
        fn write_line(&mut self, text: &str, line: Line) -> anyhow::Result<()> {
            if self.fail_after.is_some_and(|n| self.writes.len() >= n) {
                anyhow::bail!("i2c bus error");
            }
            self.writes.push((line, text.to_string()));
            Ok(())
        }

        fn clear(&mut self) -> anyhow::Result<()> {
            self.cleared = true;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_within_a_tick_and_clears() {
        let store = StatusStore::new(doc(Status::Up));
        let mut renderer = RecordingRenderer::default();
        let engine = DisplayEngine::new(&DisplaySettings::default(), Instant::now());

        let reason = engine
            .run(&store, &mut renderer, tokio::time::sleep(Duration::from_millis(1_250)))
            .await;

        assert_eq!(reason, ShutdownReason::Interrupted);
        assert!(renderer.cleared);
        // Ticks at 0, 500 and 1000ms.
        assert_eq!(renderer.writes.len(), 6);
        assert_eq!(renderer.writes[1], (Line::Second, "NAS_GOPI → UP   ".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn renderer_failure_shuts_down_and_clears() {
        let store = StatusStore::new(doc(Status::Down));
        let mut renderer = RecordingRenderer {
            fail_after: Some(3),
            ..RecordingRenderer::default()
        };
        let engine = DisplayEngine::new(&DisplaySettings::default(), Instant::now());

        let reason = engine.run(&store, &mut renderer, std::future::pending()).await;

        assert_eq!(reason, ShutdownReason::RendererFailed);
        assert!(renderer.cleared);
        assert_eq!(renderer.writes[1], (Line::Second, "----NET DOWN----".to_string()));
    }
}
