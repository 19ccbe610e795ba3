use crate::chunk_id::{ChunkId, CHUNK_ID_WIRE_LEN};
use crate::error::{CaissonError, Result};

/// One step of a backup's reassembly program: either literal bytes or a
/// reference to a deduplicated chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Bytes(Vec<u8>),
    Chunk(ChunkId),
}

const TAG_BYTES: u8 = 0;
const TAG_CHUNK: u8 = 1;

/// Serializes an instruction list to the byte stream that gets
/// recursively re-chunked and ultimately stored in the descriptor.
/// Chunk references cost 29 bytes, so each pass over a chunk-heavy
/// stream shrinks it dramatically.
pub fn encode(instructions: &[Instruction]) -> Vec<u8> {
    let mut out = Vec::new();
    for instruction in instructions {
        match instruction {
            Instruction::Bytes(data) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            Instruction::Chunk(id) => {
                out.push(TAG_CHUNK);
                out.extend_from_slice(&id.to_wire());
                out.extend_from_slice(&id.size.to_le_bytes());
            }
        }
    }
    out
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    if data.len() - *pos < len {
        return Err(CaissonError::UnexpectedEndOfInput(
            "instruction stream".to_string(),
        ));
    }
    let out = &data[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let tag = take(data, &mut pos, 1)?[0];
        match tag {
            TAG_BYTES => {
                let len =
                    u32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap()) as usize;
                instructions.push(Instruction::Bytes(take(data, &mut pos, len)?.to_vec()));
            }
            TAG_CHUNK => {
                let wire: [u8; CHUNK_ID_WIRE_LEN] =
                    take(data, &mut pos, CHUNK_ID_WIRE_LEN)?.try_into().unwrap();
                let size = u32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
                instructions.push(Instruction::Chunk(ChunkId::from_wire(&wire, size)));
            }
            other => {
                return Err(CaissonError::Other(format!(
                    "invalid instruction tag {other}"
                )))
            }
        }
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> ChunkId {
        ChunkId {
            hash0: 11,
            hash1: 22,
            rolling: 33,
            size: 4096,
        }
    }

    #[test]
    fn round_trip() {
        let instructions = vec![
            Instruction::Bytes(b"literal head".to_vec()),
            Instruction::Chunk(sample_id()),
            Instruction::Bytes(Vec::new()),
            Instruction::Chunk(ChunkId {
                size: 1,
                ..sample_id()
            }),
        ];
        let encoded = encode(&instructions);
        assert_eq!(decode(&encoded).unwrap(), instructions);
    }

    #[test]
    fn chunk_reference_is_29_bytes() {
        let encoded = encode(&[Instruction::Chunk(sample_id())]);
        assert_eq!(encoded.len(), 29);
    }

    #[test]
    fn truncated_stream_fails() {
        let mut encoded = encode(&[Instruction::Chunk(sample_id())]);
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            decode(&encoded),
            Err(CaissonError::UnexpectedEndOfInput(_))
        ));
    }

    #[test]
    fn bad_tag_fails() {
        assert!(decode(&[9]).is_err());
    }
}
