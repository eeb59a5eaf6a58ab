use crate::error::{Result, TranslateError};
use crate::functional::{read_u32, take};
use crate::vocab::{Vocabulary, EOS, PAD};

use memmap2::Mmap;
use std::fs::{self, File};
use std::path::Path;

pub const BUNDLE_MAGIC: [u8; 4] = *b"trds";
pub const BUNDLE_VERSION: u32 = 1;

/// Longest source sequence fed to the encoder.
pub const MAX_TOKEN_SEQ_LEN: usize = 140;

#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub src: Vec<u32>,
    pub trg: Vec<u32>,
}

/// Vocabularies plus the held-out test pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBundle {
    pub src_vocab: Vocabulary,
    pub trg_vocab: Vocabulary,
    pub test: Vec<Example>,
}

fn read_indices(data: &[u8], offset: &mut usize, vocab_size: usize) -> Result<Vec<u32>> {
    let len = read_u32(data, offset)? as usize;
    let start = *offset;
    let bytes = take(data, offset, len.checked_mul(4).unwrap_or(usize::MAX))?;

    let indices: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    if let Some(pos) = indices.iter().position(|&i| i as usize >= vocab_size) {
        return Err(TranslateError::Corrupt {
            offset: start + pos * 4,
            reason: format!("index {} outside vocabulary of {}", indices[pos], vocab_size),
        });
    }

    Ok(indices)
}

fn write_indices(out: &mut Vec<u8>, indices: &[u32]) {
    out.extend_from_slice(&(indices.len() as u32).to_le_bytes());
    for i in indices {
        out.extend_from_slice(&i.to_le_bytes());
    }
}

impl DataBundle {
    pub fn parse(data: &[u8]) -> Result<DataBundle> {
        let mut offset: usize = 0;

        let magic = take(data, &mut offset, 4)?;
        if magic != BUNDLE_MAGIC {
            return Err(TranslateError::BadMagic {
                expected: BUNDLE_MAGIC,
                got: magic.to_vec(),
            });
        }

        let version = read_u32(data, &mut offset)?;
        if version != BUNDLE_VERSION {
            return Err(TranslateError::UnsupportedVersion {
                kind: "data bundle",
                version,
            });
        }

        let src_vocab = Vocabulary::parse(data, &mut offset)?;
        let trg_vocab = Vocabulary::parse(data, &mut offset)?;

        let n_examples = read_u32(data, &mut offset)?;
        let mut test = Vec::with_capacity(n_examples.min(1 << 20) as usize);

        for i in 0..n_examples {
            let start = offset;
            let src = read_indices(data, &mut offset, src_vocab.len())?;
            if src.iter().all(|&t| t == PAD) {
                return Err(TranslateError::Corrupt {
                    offset: start,
                    reason: format!("test example {} has no source tokens", i),
                });
            }

            let trg = read_indices(data, &mut offset, trg_vocab.len())?;
            test.push(Example { src, trg });
        }

        if offset != data.len() {
            return Err(TranslateError::Corrupt {
                offset,
                reason: format!("{} trailing bytes", data.len() - offset),
            });
        }

        Ok(DataBundle {
            src_vocab,
            trg_vocab,
            test,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<DataBundle> {
        let path = path.as_ref();

        let file = File::open(path).map_err(|source| TranslateError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let data = unsafe { Mmap::map(&file) }.map_err(|source| TranslateError::Mmap {
            path: path.to_path_buf(),
            source,
        })?;

        DataBundle::parse(&data)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&BUNDLE_MAGIC);
        out.extend_from_slice(&BUNDLE_VERSION.to_le_bytes());
        self.src_vocab.write_to(&mut out);
        self.trg_vocab.write_to(&mut out);

        out.extend_from_slice(&(self.test.len() as u32).to_le_bytes());
        for ex in &self.test {
            write_indices(&mut out, &ex.src);
            write_indices(&mut out, &ex.trg);
        }

        out
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path.as_ref(), self.to_bytes()).map_err(|source| TranslateError::FileWrite {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }
}

/// Drops trailing padding and caps the length at `max_len`. When the cap
/// cuts off a closing EOS, the last kept position becomes EOS again.
/// Returns the prepared sequence and whether anything was cut.
pub fn prepare_source(src: &[u32], max_len: usize) -> (Vec<u32>, bool) {
    let end = src.iter().rposition(|&t| t != PAD).map_or(0, |p| p + 1);
    let src = &src[..end];

    if src.len() <= max_len {
        return (src.to_vec(), false);
    }

    let mut cut = src[..max_len].to_vec();
    if src.last() == Some(&EOS) {
        if let Some(last) = cut.last_mut() {
            *last = EOS;
        }
    }

    (cut, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::BOS;

    fn bundle() -> DataBundle {
        DataBundle {
            src_vocab: Vocabulary::from_labels(["ein", "hund"]).unwrap(),
            trg_vocab: Vocabulary::from_labels(["a", "dog", "barks"]).unwrap(),
            test: vec![
                Example {
                    src: vec![BOS, 4, 5, EOS],
                    trg: vec![BOS, 4, 5, EOS],
                },
                Example {
                    src: vec![BOS, 5, EOS, PAD, PAD],
                    trg: vec![BOS, 6, EOS],
                },
            ],
        }
    }

    #[test]
    fn bundle_survives_serialization() {
        let b = bundle();
        assert_eq!(DataBundle::parse(&b.to_bytes()).unwrap(), b);
    }

    #[test]
    fn rejects_foreign_files() {
        let mut data = bundle().to_bytes();
        data[..4].copy_from_slice(b"trck");

        assert!(matches!(DataBundle::parse(&data), Err(TranslateError::BadMagic { .. })));
    }

    #[test]
    fn rejects_truncated_and_padded_files() {
        let data = bundle().to_bytes();

        assert!(matches!(
            DataBundle::parse(&data[..data.len() - 3]),
            Err(TranslateError::Corrupt { .. })
        ));

        let mut longer = data.clone();
        longer.push(0);
        assert!(matches!(DataBundle::parse(&longer), Err(TranslateError::Corrupt { .. })));
    }

    #[test]
    fn rejects_indices_outside_the_vocabulary() {
        let mut b = bundle();
        b.test[0].src[1] = 6;

        assert!(matches!(
            DataBundle::parse(&b.to_bytes()),
            Err(TranslateError::Corrupt { .. })
        ));
    }

    #[test]
    fn rejects_examples_without_source_tokens() {
        for src in [vec![], vec![PAD, PAD]] {
            let mut b = bundle();
            b.test[1].src = src;

            let data = b.to_bytes();
            let second = data.len() - (4 + 4 * 3) - 4 - 4 * b.test[1].src.len();

            match DataBundle::parse(&data) {
                Err(TranslateError::Corrupt { offset, .. }) => assert_eq!(offset, second),
                other => panic!("expected a corrupt bundle, got {:?}", other),
            }
        }
    }

    #[test]
    fn prepare_source_strips_padding() {
        let (src, cut) = prepare_source(&[BOS, 5, EOS, PAD, PAD], MAX_TOKEN_SEQ_LEN);

        assert_eq!(src, vec![BOS, 5, EOS]);
        assert!(!cut);
    }

    #[test]
    fn prepare_source_truncates_and_keeps_the_end_marker() {
        let long: Vec<u32> = std::iter::once(BOS)
            .chain(std::iter::repeat(4).take(200))
            .chain(std::iter::once(EOS))
            .collect();

        let (src, cut) = prepare_source(&long, MAX_TOKEN_SEQ_LEN);

        assert!(cut);
        assert_eq!(src.len(), MAX_TOKEN_SEQ_LEN);
        assert_eq!(src[0], BOS);
        assert_eq!(*src.last().unwrap(), EOS);

        let (src, cut) = prepare_source(&[4, 4, 4, 4], 2);
        assert!(cut);
        assert_eq!(src, vec![4, 4]);
    }
}
