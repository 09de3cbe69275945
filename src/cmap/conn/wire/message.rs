use std::io::Read;

use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::header::{Header, OpCode};
use crate::{
    bson::Document,
    cmap::conn::command::Command,
    compression::{decompress, Compressor, CompressorId},
    error::{Error, ErrorKind, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) sections: Vec<MessageSection>,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

impl Message {
    /// Creates a `Message` from a given `Command`. The command's handle to its target database
    /// is folded into the body document as `$db`, as required by the wire format.
    pub(crate) fn from_command(command: Command, request_id: Option<i32>) -> Self {
        let mut body = command.body;
        body.insert("$db", command.target_db);

        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        Self {
            response_to: 0,
            flags,
            sections: vec![MessageSection::Document(body)],
            checksum: None,
            request_id,
        }
    }

    /// Gets the first document contained in this Message.
    pub(crate) fn single_document_response(self) -> Result<Document> {
        self.sections
            .into_iter()
            .next()
            .and_then(|section| match section {
                MessageSection::Document(doc) => Some(doc),
                MessageSection::Sequence { documents, .. } => documents.into_iter().next(),
            })
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: "no response received from server".into(),
                }
                .into()
            })
    }

    /// Reads bytes from `reader` and deserializes them into a Message, transparently
    /// decompressing OP_COMPRESSED envelopes.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;

        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if header.length < Header::LENGTH as i32 || header.length > max_len {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "The server indicated a reply of {} bytes, but replies may not exceed {} \
                     bytes",
                    header.length, max_len
                ),
            }
            .into());
        }

        let mut body = vec![0u8; (header.length - Header::LENGTH as i32) as usize];
        reader.read_exact(&mut body).await?;

        match header.op_code {
            OpCode::Message => Self::parse_body(header.response_to, &body),
            OpCode::Compressed => {
                let body = decompress_body(&body)?;
                Self::parse_body(header.response_to, &body)
            }
            other => Err(ErrorKind::InvalidResponse {
                message: format!("unexpected opcode in server reply: {:?}", other),
            }
            .into()),
        }
    }

    fn parse_body(response_to: i32, body: &[u8]) -> Result<Self> {
        let mut reader = std::io::Cursor::new(body);

        let mut flag_bytes = [0u8; 4];
        std::io::Read::read_exact(&mut reader, &mut flag_bytes)?;
        let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(flag_bytes));

        let checksum_len: usize = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };
        let sections_end = (body.len() - checksum_len) as u64;

        let mut sections = Vec::new();
        while reader.position() < sections_end {
            sections.push(MessageSection::read(&mut reader, sections_end)?);
        }

        let mut checksum = None;
        if checksum_len > 0 {
            let mut checksum_bytes = [0u8; 4];
            std::io::Read::read_exact(&mut reader, &mut checksum_bytes)?;
            checksum = Some(u32::from_le_bytes(checksum_bytes));
        }

        Ok(Self {
            response_to,
            flags,
            sections,
            checksum,
            request_id: None,
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> Result<()> {
        let sections_bytes = self.sections_bytes()?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections_bytes.len()
            + self
                .checksum
                .as_ref()
                .map(std::mem::size_of_val)
                .unwrap_or(0);

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or_else(super::util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&self.flags.bits().to_le_bytes()).await?;
        writer.write_all(&sections_bytes).await?;

        if let Some(checksum) = self.checksum {
            writer.write_all(&checksum.to_le_bytes()).await?;
        }

        writer.flush().await?;

        Ok(())
    }

    /// Serializes the Message, compresses it with `compressor`, and writes the OP_COMPRESSED
    /// envelope to `writer`.
    pub(crate) async fn write_compressed_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        compressor: &Compressor,
    ) -> Result<()> {
        // The compressed payload is the flag bits and sections of the equivalent OP_MSG.
        let mut uncompressed = Vec::new();
        uncompressed.extend_from_slice(&self.flags.bits().to_le_bytes());
        uncompressed.extend_from_slice(&self.sections_bytes()?);

        let compressed = compressor.compress(&uncompressed)?;

        let total_length = Header::LENGTH
            + 2 * std::mem::size_of::<i32>()
            + std::mem::size_of::<u8>()
            + compressed.len();

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or_else(super::util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        header.write_to(writer).await?;
        writer
            .write_all(&(OpCode::Message as i32).to_le_bytes())
            .await?;
        writer
            .write_all(&(uncompressed.len() as i32).to_le_bytes())
            .await?;
        writer.write_all(&[compressor.id() as u8]).await?;
        writer.write_all(&compressed).await?;

        writer.flush().await?;

        Ok(())
    }

    fn sections_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for section in &self.sections {
            section.write(&mut bytes)?;
        }
        Ok(bytes)
    }
}

/// Strip the OP_COMPRESSED preamble and inflate the wrapped message body.
fn decompress_body(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 9 {
        return Err(ErrorKind::InvalidResponse {
            message: "OP_COMPRESSED reply too short".to_string(),
        }
        .into());
    }

    let original_opcode = i32::from_le_bytes(body[0..4].try_into().unwrap());
    if OpCode::from_i32(original_opcode)? != OpCode::Message {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "expected OP_COMPRESSED to wrap an OP_MSG, instead got opcode {}",
                original_opcode
            ),
        }
        .into());
    }

    let uncompressed_size = i32::from_le_bytes(body[4..8].try_into().unwrap());
    let compressor_id = CompressorId::from_u8(body[8])?;

    let decompressed = decompress(compressor_id, &body[9..])?;
    if decompressed.len() as i64 != uncompressed_size as i64 {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "the server indicated an uncompressed size of {} bytes, but the reply inflated \
                 to {}",
                uncompressed_size,
                decompressed.len()
            ),
        }
        .into());
    }

    Ok(decompressed)
}

const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

bitflags! {
    /// The flag bits of an OP_MSG.
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// A section of an OP_MSG.
#[derive(Debug)]
pub(crate) enum MessageSection {
    /// A single document (payload type 0).
    Document(Document),

    /// A sequence of documents attached to a command field (payload type 1).
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection. `limit` is the
    /// position past which sections must not extend (i.e. the start of the trailing checksum,
    /// if any).
    fn read(reader: &mut std::io::Cursor<&[u8]>, limit: u64) -> Result<Self> {
        let mut payload_type = [0u8; 1];
        std::io::Read::read_exact(reader, &mut payload_type)?;

        if payload_type[0] == 0 {
            let document = Document::from_reader(&mut *reader)
                .map_err(|e| Error::from(ErrorKind::InvalidResponse {
                    message: format!("invalid document in server reply: {}", e),
                }))?;
            return Ok(MessageSection::Document(document));
        }

        let mut size_bytes = [0u8; 4];
        std::io::Read::read_exact(reader, &mut size_bytes)?;
        let size = i32::from_le_bytes(size_bytes);
        let section_end = reader.position() - std::mem::size_of::<i32>() as u64 + size as u64;

        if section_end > limit {
            return Err(ErrorKind::InvalidResponse {
                message: "document sequence extends past the end of the reply".to_string(),
            }
            .into());
        }

        let mut identifier_bytes = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            std::io::Read::read_exact(reader, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            identifier_bytes.push(byte[0]);
        }
        let identifier = String::from_utf8(identifier_bytes).map_err(|_| {
            Error::from(ErrorKind::InvalidResponse {
                message: "document sequence identifier is not valid UTF-8".to_string(),
            })
        })?;

        let mut documents = Vec::new();
        while reader.position() < section_end {
            let document = Document::from_reader(&mut *reader)
                .map_err(|e| Error::from(ErrorKind::InvalidResponse {
                    message: format!("invalid document in server reply: {}", e),
                }))?;
            documents.push(document);
        }

        if reader.position() != section_end {
            return Err(ErrorKind::InvalidResponse {
                message: "document sequence length does not match its contents".to_string(),
            }
            .into());
        }

        Ok(MessageSection::Sequence {
            identifier,
            documents,
        })
    }

    /// Serializes the MessageSection and appends the bytes to `buffer`.
    fn write(&self, buffer: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Document(doc) => {
                buffer.push(0);
                doc.to_writer(&mut *buffer)?;
            }
            Self::Sequence {
                identifier,
                documents,
            } => {
                buffer.push(1);

                let size_index = buffer.len();
                buffer.extend_from_slice(&[0u8; 4]);

                buffer.extend_from_slice(identifier.as_bytes());
                buffer.push(0);

                for doc in documents {
                    doc.to_writer(&mut *buffer)?;
                }

                let size = (buffer.len() - size_index) as i32;
                buffer[size_index..size_index + 4].copy_from_slice(&size.to_le_bytes());
            }
        }

        Ok(())
    }
}
