use crate::error::{Result, TranslateError};
use crate::functional::{read_u32, take};

use std::collections::HashMap;

pub const PAD_WORD: &str = "<blank>";
pub const UNK_WORD: &str = "<unk>";
pub const BOS_WORD: &str = "<s>";
pub const EOS_WORD: &str = "</s>";

pub const PAD: u32 = 0;
pub const UNK: u32 = 1;
pub const BOS: u32 = 2;
pub const EOS: u32 = 3;

const RESERVED: [&str; 4] = [PAD_WORD, UNK_WORD, BOS_WORD, EOS_WORD];

/// Bidirectional label/index table. The first four entries are always the
/// reserved symbols, so `PAD`, `UNK`, `BOS` and `EOS` are valid for every
/// vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    idx_to_label: Vec<String>,
    label_to_idx: HashMap<String, u32>,
}

impl Vocabulary {
    /// Builds a vocabulary from content labels; reserved symbols are prepended.
    pub fn from_labels<I, S>(labels: I) -> Result<Vocabulary>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let all = RESERVED
            .iter()
            .map(|s| s.to_string())
            .chain(labels.into_iter().map(Into::into))
            .collect();

        Vocabulary::from_table(all)
    }

    fn from_table(idx_to_label: Vec<String>) -> Result<Vocabulary> {
        for (index, &expected) in RESERVED.iter().enumerate() {
            match idx_to_label.get(index) {
                Some(found) if found == expected => {}
                found => {
                    return Err(TranslateError::ReservedSymbol {
                        expected,
                        index: index as u32,
                        found: found.cloned().unwrap_or_default(),
                    })
                }
            }
        }

        let mut label_to_idx = HashMap::with_capacity(idx_to_label.len());

        for (index, label) in idx_to_label.iter().enumerate() {
            if label_to_idx.insert(label.clone(), index as u32).is_some() {
                return Err(TranslateError::DuplicateLabel {
                    label: label.clone(),
                    index: index as u32,
                });
            }
        }

        Ok(Vocabulary {
            idx_to_label,
            label_to_idx,
        })
    }

    /// Parses a vocabulary block starting at `offset`, advancing it past the block.
    pub fn parse(data: &[u8], offset: &mut usize) -> Result<Vocabulary> {
        let size = read_u32(data, offset)?;
        let mut idx_to_label: Vec<String> = Vec::with_capacity(size.min(1 << 20) as usize);

        for _ in 0..size {
            let str_len = read_u32(data, offset)? as usize;
            let start = *offset;
            let bytes = take(data, offset, str_len)?;

            let label = String::from_utf8(bytes.to_vec()).map_err(|e| TranslateError::Corrupt {
                offset: start,
                reason: format!("label is not UTF-8: {}", e),
            })?;

            idx_to_label.push(label);
        }

        Vocabulary::from_table(idx_to_label)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.idx_to_label.len() as u32).to_le_bytes());

        for label in &self.idx_to_label {
            out.extend_from_slice(&(label.len() as u32).to_le_bytes());
            out.extend_from_slice(label.as_bytes());
        }
    }

    pub fn len(&self) -> usize {
        self.idx_to_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx_to_label.is_empty()
    }

    /// Index of `label`, or `UNK` when it is not in the table.
    pub fn index(&self, label: &str) -> u32 {
        self.label_to_idx.get(label).copied().unwrap_or(UNK)
    }

    pub fn label(&self, index: u32) -> Result<&str> {
        self.idx_to_label
            .get(index as usize)
            .map(String::as_str)
            .ok_or(TranslateError::UnknownIndex(index))
    }

    pub fn is_control(index: u32) -> bool {
        index == PAD || index == BOS || index == EOS
    }

    /// Whitespace-joined labels of `indices`, with pad/begin/end dropped.
    pub fn decode_line(&self, indices: &[u32]) -> Result<String> {
        let mut pieces: Vec<&str> = Vec::with_capacity(indices.len());

        for &idx in indices {
            if Vocabulary::is_control(idx) {
                continue;
            }
            pieces.push(self.label(idx)?);
        }

        Ok(pieces.join(" "))
    }
}
