//! Renderers: a text status board and annotated frame snapshots.

use crate::effects::{RenderRequest, Renderer, SinkError};
use crate::pipeline::{FaceOutcome, FaceStatus};
use image::{GrayImage, Luma};
use rollcall_core::LedgerSnapshot;
use std::io::Write;
use std::path::PathBuf;

/// Prints per-face captions and the status board, each only when it changes.
pub struct BoardRenderer<W> {
    out: W,
    last: Option<LedgerSnapshot>,
    captions: Vec<String>,
}

impl BoardRenderer<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> BoardRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last: None,
            captions: Vec::new(),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Renderer for BoardRenderer<W> {
    fn render(&mut self, request: &RenderRequest) -> Result<(), SinkError> {
        let captions: Vec<String> = request.report.faces.iter().map(FaceOutcome::label).collect();
        if !captions.is_empty() && captions != self.captions {
            writeln!(self.out, "frame {}: {}", request.report.sequence, captions.join(" | "))?;
        }
        self.captions = captions;

        if self.last.as_ref() != Some(&*request.board) {
            write_board(&mut self.out, &request.board)?;
            self.last = Some((*request.board).clone());
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Write the board: one line per identity, then the counts.
pub fn write_board<W: Write>(out: &mut W, board: &LedgerSnapshot) -> std::io::Result<()> {
    let width = board
        .records
        .iter()
        .map(|r| r.identity.as_str().chars().count())
        .max()
        .unwrap_or(0)
        .max(4);

    writeln!(out, "--- attendance (late after {}) ---", board.cutoff.format("%H:%M:%S"))?;
    for record in &board.records {
        writeln!(
            out,
            "{:<width$}  {:<7}  {}",
            record.identity.as_str(),
            record.status.kind().as_str(),
            record.status.arrival_text(),
        )?;
    }
    let s = board.summary();
    writeln!(out, "present {} / late {} / absent {}", s.present, s.late, s.absent)
}

/// Saves an annotated PNG of every frame in which someone checked in.
pub struct SnapshotRenderer {
    dir: PathBuf,
}

impl SnapshotRenderer {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl Renderer for SnapshotRenderer {
    fn render(&mut self, request: &RenderRequest) -> Result<(), SinkError> {
        if request.report.transitions.is_empty() {
            return Ok(());
        }

        let frame = &request.frame;
        let mut img = GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| std::io::Error::other("frame buffer does not match its dimensions"))?;
        for face in &request.report.faces {
            draw_outline(&mut img, face);
        }

        let path = self.dir.join(format!("frame-{:06}.png", request.report.sequence));
        img.save(&path)?;

        let names: Vec<&str> = request
            .report
            .transitions
            .iter()
            .map(|t| t.identity.as_str())
            .collect();
        tracing::info!(path = %path.display(), ?names, "snapshot saved");
        Ok(())
    }
}

const OUTLINE: u32 = 2;

/// White box for recognized faces, black for unknown ones.
fn draw_outline(img: &mut GrayImage, face: &FaceOutcome) {
    let shade = match face.status {
        FaceStatus::Unknown => Luma([0u8]),
        _ => Luma([255u8]),
    };
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }

    let clamp = |v: f32, max: u32| (v.max(0.0) as u32).min(max - 1);
    let x0 = clamp(face.bbox.x, w);
    let y0 = clamp(face.bbox.y, h);
    let x1 = clamp(face.bbox.x + face.bbox.width, w);
    let y1 = clamp(face.bbox.y + face.bbox.height, h);

    for y in y0..=y1 {
        for x in x0..=x1 {
            let on_edge = x < x0 + OUTLINE || x + OUTLINE > x1 || y < y0 + OUTLINE || y + OUTLINE > y1;
            if on_edge {
                img.put_pixel(x, y, shade);
            }
        }
    }
}

/// Fans one request out to several renderers; one failing does not stop the rest.
pub struct Renderers(pub Vec<Box<dyn Renderer>>);

impl Renderer for Renderers {
    fn render(&mut self, request: &RenderRequest) -> Result<(), SinkError> {
        let mut first_err = None;
        for renderer in &mut self.0 {
            if let Err(e) = renderer.render(request) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
