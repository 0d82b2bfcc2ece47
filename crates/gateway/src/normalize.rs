//! Splitting multi-part turns into plain text plus detached attachments.

use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    tracing::warn,
};

use brainproxy_protocol::{ChatTurn, ContentPart, FileBlob, MessageContent};

/// A decoded attachment accepted for ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FileRejection {
    #[error("decoded size {size} exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
}

#[derive(Debug, Default)]
pub struct Normalized {
    pub turns: Vec<ChatTurn>,
    pub files: Vec<Attachment>,
    pub rejected: Vec<(String, FileRejection)>,
}

/// Flatten every turn to scalar text and pull out file attachments.
///
/// Text parts are joined with `\n` in order. Image and unknown parts add
/// nothing. A multi-part turn without any text part is dropped. Files larger
/// than `max_bytes` once decoded, or that fail to decode, are rejected and
/// logged.
pub fn normalize(turns: &[ChatTurn], max_bytes: u64) -> Normalized {
    let mut out = Normalized::default();

    for turn in turns {
        let parts = match &turn.content {
            MessageContent::Text(_) => {
                out.turns.push(turn.clone());
                continue;
            },
            MessageContent::Parts(parts) => parts,
        };

        let mut texts: Vec<&str> = Vec::new();
        for part in parts {
            match part {
                ContentPart::Text { text } => texts.push(text),
                ContentPart::FileData { file_data } => match decode(file_data, max_bytes) {
                    Ok(attachment) => out.files.push(attachment),
                    Err(reason) => {
                        warn!(file = %file_data.name, mime = %file_data.mime, reason = %reason, "attachment rejected");
                        out.rejected.push((file_data.name.clone(), reason));
                    },
                },
                ContentPart::ImageUrl { .. } | ContentPart::Other => {},
            }
        }

        if !texts.is_empty() {
            out.turns.push(ChatTurn::new(turn.role, texts.join("\n")));
        }
    }

    out
}

/// Decoded size of canonical base64 input, computed without decoding.
fn decoded_len(data: &str) -> u64 {
    let len = data.len() as u64;
    let padding = data.bytes().rev().take_while(|b| *b == b'=').count() as u64;
    (len / 4 * 3 + (len % 4).saturating_sub(1)).saturating_sub(padding)
}

fn decode(blob: &FileBlob, max_bytes: u64) -> Result<Attachment, FileRejection> {
    let data: String = blob
        .data
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    let estimate = decoded_len(&data);
    if estimate > max_bytes {
        return Err(FileRejection::TooLarge {
            size: estimate,
            limit: max_bytes,
        });
    }

    let bytes = STANDARD
        .decode(data.as_bytes())
        .map_err(|e| FileRejection::InvalidBase64(e.to_string()))?;
    let size = bytes.len() as u64;
    if size > max_bytes {
        return Err(FileRejection::TooLarge {
            size,
            limit: max_bytes,
        });
    }

    Ok(Attachment {
        name: blob.name.clone(),
        mime: blob.mime.clone(),
        bytes,
    })
}
