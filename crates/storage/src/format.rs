use serde::{Deserialize, Serialize};

/// Declared format of a distributed payload.
///
/// Each format owns a textual delimiter pair. The pair frames the payload
/// both inside a `DataTransmit` packet and inside the content store buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadFormat {
    File,
    Task,
}

impl PayloadFormat {
    pub const ALL: [PayloadFormat; 2] = [PayloadFormat::File, PayloadFormat::Task];

    pub fn open(self) -> &'static str {
        match self {
            PayloadFormat::File => "<File>",
            PayloadFormat::Task => "<Task>",
        }
    }

    pub fn close(self) -> &'static str {
        match self {
            PayloadFormat::File => "</File>",
            PayloadFormat::Task => "</Task>",
        }
    }

    /// Frame already encoded text with this format's delimiters.
    pub fn wrap(self, content: &str) -> String {
        let mut out = String::with_capacity(self.open().len() + content.len() + self.close().len());
        out.push_str(self.open());
        out.push_str(content);
        out.push_str(self.close());
        out
    }

    /// Identify the format whose opening delimiter starts `text`.
    pub fn detect(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| text.starts_with(f.open()))
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadFormat::File => write!(f, "File"),
            PayloadFormat::Task => write!(f, "Task"),
        }
    }
}
