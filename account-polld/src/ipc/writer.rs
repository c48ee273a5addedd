use std::io::Write;

use parking_lot::Mutex;
use push_message::PushMessage;

use super::Outbound;
use crate::Result;
use crate::notification::{ApplicationId, PostalTransport};

/// Serialises [`Outbound`] lines onto a shared writer.
///
/// Each line is written and flushed under the lock, so lines from different
/// tasks never interleave.
pub struct JsonLineWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLineWriter {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn write(&self, line: &Outbound<'_>) -> Result<()> {
        let mut encoded = serde_json::to_vec(line)?;
        encoded.push(b'\n');

        let mut out = self.out.lock();
        out.write_all(&encoded)?;
        out.flush()?;
        Ok(())
    }
}

impl PostalTransport for JsonLineWriter {
    fn post(
        &self,
        application_id: &ApplicationId,
        object_path: &str,
        message: &PushMessage,
    ) -> Result<()> {
        self.write(&Outbound::Post {
            application_id: application_id.as_str(),
            object_path,
            message,
        })
    }
}

impl std::fmt::Debug for JsonLineWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLineWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Cloneable in-memory writer.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub(crate) fn lines(&self) -> Vec<serde_json::Value> {
            String::from_utf8(self.0.lock().clone())
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_post_line() {
        let buf = SharedBuf::default();
        let writer = JsonLineWriter::new(buf.clone());
        let app = ApplicationId::parse("com.ubuntu.music_music").unwrap();
        let message = PushMessage::standard("Hi", "there", "", "", 0, "mail");

        writer.post(&app, &app.push_object_path(), &message).unwrap();
        writer.post(&app, &app.push_object_path(), &message).unwrap();

        let lines = buf.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "post");
        assert_eq!(lines[0]["application_id"], "com.ubuntu.music_music");
        assert_eq!(lines[0]["object_path"], "/com/ubuntu/Postal/com_2eubuntu_2emusic");
        assert_eq!(lines[0]["message"]["notification"]["card"]["summary"], "Hi");
    }
}
