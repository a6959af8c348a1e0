use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

/// One line of the playback trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent<'a> {
    Start {
        cols: u32,
        rows: u32,
        frame_width: u32,
        frame_height: u32,
        pool_size: usize,
    },
    FrameReady {
        frame: u64,
    },
    FrameUpdate {
        frame: u64,
        jitter: bool,
        delta_secs: f64,
    },
    Drained {
        presented: u64,
    },
    Failed {
        reason: &'a str,
    },
}

/// JSON-lines playback trace. Disabled tracers drop every event.
pub struct PlaybackTracer {
    writer: Option<Box<dyn Write + Send>>,
}

impl PlaybackTracer {
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Some(Box::new(writer)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn record(&mut self, event: &TraceEvent<'_>) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));
        if let Err(err) = result {
            log::warn!(target: "pipeline", "playback trace disabled after write failure: {err}");
            self.writer = None;
        }
    }

    pub fn flush(&mut self) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(err) = writer.flush() {
            log::warn!(target: "pipeline", "playback trace disabled after flush failure: {err}");
            self.writer = None;
        }
    }
}

impl Drop for PlaybackTracer {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("trace buffer lock").extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _bytes: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn events_are_written_as_tagged_json_lines() {
        let buffer = SharedBuffer::default();
        let mut tracer = PlaybackTracer::from_writer(buffer.clone());
        tracer.record(&TraceEvent::FrameReady { frame: 4 });
        tracer.record(&TraceEvent::FrameUpdate {
            frame: 4,
            jitter: true,
            delta_secs: 0.25,
        });
        tracer.record(&TraceEvent::Failed { reason: "dup" });

        let text = String::from_utf8(buffer.0.lock().expect("lock").clone()).expect("utf8");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "frame_ready");
        assert_eq!(lines[0]["frame"], 4);
        assert_eq!(lines[1]["event"], "frame_update");
        assert_eq!(lines[1]["jitter"], true);
        assert_eq!(lines[2]["reason"], "dup");
    }

    #[test]
    fn write_failure_disables_the_trace() {
        let mut tracer = PlaybackTracer::from_writer(FailingWriter);
        tracer.record(&TraceEvent::Drained { presented: 1 });
        assert!(!tracer.is_enabled());
        tracer.record(&TraceEvent::Drained { presented: 2 });
    }
}
