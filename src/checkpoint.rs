//! Versioned checkpoint container.
//!
//! A 128-byte header (magic, version, hyperparameters) followed by the f32
//! parameters, each kind stacked over layers. The payload is memory mapped
//! and viewed in place.

use crate::error::{Result, TranslateError};
use crate::functional::{read_f32, read_u32, take, u8_to_f32_slice};

use memmap2::Mmap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const CHECKPOINT_MAGIC: [u8; 4] = *b"trck";
pub const CHECKPOINT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;
/// Upper bound on the sinusoid table rows a checkpoint may ask for.
pub const MAX_POSITIONS: usize = 1 << 16;

/// Hyperparameters needed to rebuild the model shape.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ModelSettings {
    pub src_vocab_size: usize,
    pub trg_vocab_size: usize,
    pub src_pad_idx: u32,
    pub trg_pad_idx: u32,
    pub d_word_vec: usize,
    pub d_model: usize,
    pub d_inner: usize,
    pub d_k: usize,
    pub d_v: usize,
    pub n_layers: usize,
    pub n_head: usize,
    pub n_position: usize,
    pub dropout: f32,
    pub embs_share_weight: bool,
    pub proj_share_weight: bool,
}

impl ModelSettings {
    pub fn parse(data: &[u8]) -> Result<ModelSettings> {
        let mut offset = 0;

        let magic = take(data, &mut offset, 4)?;
        if magic != CHECKPOINT_MAGIC {
            return Err(TranslateError::BadMagic {
                expected: CHECKPOINT_MAGIC,
                got: magic.to_vec(),
            });
        }

        let version = read_u32(data, &mut offset)?;
        if version != CHECKPOINT_VERSION {
            return Err(TranslateError::UnsupportedVersion {
                kind: "checkpoint",
                version,
            });
        }

        let mut next = || read_u32(data, &mut offset).map(|v| v as usize);

        let src_vocab_size = next()?;
        let trg_vocab_size = next()?;
        let src_pad_idx = next()? as u32;
        let trg_pad_idx = next()? as u32;
        let d_word_vec = next()?;
        let d_model = next()?;
        let d_inner = next()?;
        let d_k = next()?;
        let d_v = next()?;
        let n_layers = next()?;
        let n_head = next()?;
        let n_position = next()?;

        let dropout = read_f32(data, &mut offset)?;
        let embs_share_weight = read_u32(data, &mut offset)? != 0;
        let proj_share_weight = read_u32(data, &mut offset)? != 0;

        let settings = ModelSettings {
            src_vocab_size,
            trg_vocab_size,
            src_pad_idx,
            trg_pad_idx,
            d_word_vec,
            d_model,
            d_inner,
            d_k,
            d_v,
            n_layers,
            n_head,
            n_position,
            dropout,
            embs_share_weight,
            proj_share_weight,
        };

        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("src_vocab_size", self.src_vocab_size),
            ("trg_vocab_size", self.trg_vocab_size),
            ("d_model", self.d_model),
            ("d_inner", self.d_inner),
            ("d_k", self.d_k),
            ("d_v", self.d_v),
            ("n_layers", self.n_layers),
            ("n_head", self.n_head),
            ("n_position", self.n_position),
        ];

        for (name, value) in dims {
            if value == 0 {
                return Err(TranslateError::InvalidSettings(format!("{} must be positive", name)));
            }
        }

        if self.d_word_vec != self.d_model {
            return Err(TranslateError::InvalidSettings(format!(
                "d_word_vec ({}) must equal d_model ({}) for the residual connections",
                self.d_word_vec, self.d_model
            )));
        }

        if self.src_pad_idx as usize >= self.src_vocab_size || self.trg_pad_idx as usize >= self.trg_vocab_size {
            return Err(TranslateError::InvalidSettings(String::from("pad index outside vocabulary")));
        }

        if self.embs_share_weight && self.src_vocab_size != self.trg_vocab_size {
            return Err(TranslateError::InvalidSettings(format!(
                "shared embeddings need equal vocabularies, got {} and {}",
                self.src_vocab_size, self.trg_vocab_size
            )));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TranslateError::InvalidSettings(format!("dropout {} outside [0, 1)", self.dropout)));
        }

        if self.n_position > MAX_POSITIONS || self.n_position.checked_mul(self.d_model).is_none() {
            return Err(TranslateError::InvalidSettings(format!(
                "n_position {} exceeds the {} position limit",
                self.n_position, MAX_POSITIONS
            )));
        }

        self.n_params()?;

        Ok(())
    }

    fn attention_params(&self) -> Option<usize> {
        let dm = self.d_model;
        let hk = self.n_head.checked_mul(self.d_k)?;
        let hv = self.n_head.checked_mul(self.d_v)?;

        // wq, wk, wv, wo plus the layer norm pair
        let proj = hk.checked_add(hv)?.checked_mul(dm)?.checked_mul(2)?;
        proj.checked_add(dm.checked_mul(2)?)
    }

    fn ffn_params(&self) -> Option<usize> {
        let dm = self.d_model;
        let di = self.d_inner;

        di.checked_mul(dm)?
            .checked_mul(2)?
            .checked_add(di)?
            .checked_add(dm.checked_mul(3)?)
    }

    fn checked_n_params(&self) -> Option<usize> {
        let dm = self.d_model;
        let l = self.n_layers;

        let mut rows = self.trg_vocab_size;
        if !self.embs_share_weight {
            rows = rows.checked_add(self.src_vocab_size)?;
        }
        if !self.proj_share_weight {
            rows = rows.checked_add(self.trg_vocab_size)?;
        }

        let attn = self.attention_params()?;
        let ffn = self.ffn_params()?;
        let encoder = attn.checked_add(ffn)?;
        let decoder = attn.checked_mul(2)?.checked_add(ffn)?;
        let layers = encoder.checked_add(decoder)?.checked_mul(l)?;

        rows.checked_mul(dm)?
            .checked_add(dm.checked_mul(4)?)?
            .checked_add(layers)
    }

    /// Number of f32 parameters the payload must hold.
    pub fn n_params(&self) -> Result<usize> {
        self.checked_n_params()
            .filter(|n| n.checked_mul(4).is_some())
            .ok_or_else(|| TranslateError::InvalidSettings(String::from("parameter count overflows usize")))
    }

    pub fn write_header(&self, out: &mut Vec<u8>) {
        let start = out.len();

        out.extend_from_slice(&CHECKPOINT_MAGIC);
        out.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());

        for value in [
            self.src_vocab_size,
            self.trg_vocab_size,
            self.src_pad_idx as usize,
            self.trg_pad_idx as usize,
            self.d_word_vec,
            self.d_model,
            self.d_inner,
            self.d_k,
            self.d_v,
            self.n_layers,
            self.n_head,
            self.n_position,
        ] {
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }

        out.extend_from_slice(&self.dropout.to_le_bytes());
        out.extend_from_slice(&(self.embs_share_weight as u32).to_le_bytes());
        out.extend_from_slice(&(self.proj_share_weight as u32).to_le_bytes());

        out.resize(start + HEADER_SIZE, 0);
    }
}

fn init_param<'a>(data: &'a [f32], offset: &mut usize, n: usize, size: usize) -> &'a [f32] {
    let param = &data[*offset..*offset + n * size];
    *offset += n * size;
    param
}

/// Attention block weights, stacked over layers.
pub struct AttentionWeights<'a> {
    pub wq: &'a [f32],
    pub wk: &'a [f32],
    pub wv: &'a [f32],
    pub wo: &'a [f32],
    pub ln: &'a [f32],
    pub ln_bias: &'a [f32],
}

impl<'a> AttentionWeights<'a> {
    fn init(data: &'a [f32], offset: &mut usize, s: &ModelSettings) -> AttentionWeights<'a> {
        let dm = s.d_model;
        let l = s.n_layers;

        AttentionWeights {
            wq: init_param(data, offset, l, s.n_head * s.d_k * dm),
            wk: init_param(data, offset, l, s.n_head * s.d_k * dm),
            wv: init_param(data, offset, l, s.n_head * s.d_v * dm),
            wo: init_param(data, offset, l, dm * s.n_head * s.d_v),
            ln: init_param(data, offset, l, dm),
            ln_bias: init_param(data, offset, l, dm),
        }
    }
}

/// Position-wise feed-forward weights, stacked over layers.
pub struct FfnWeights<'a> {
    pub w1: &'a [f32],
    pub b1: &'a [f32],
    pub w2: &'a [f32],
    pub b2: &'a [f32],
    pub ln: &'a [f32],
    pub ln_bias: &'a [f32],
}

impl<'a> FfnWeights<'a> {
    fn init(data: &'a [f32], offset: &mut usize, s: &ModelSettings) -> FfnWeights<'a> {
        let dm = s.d_model;
        let l = s.n_layers;

        FfnWeights {
            w1: init_param(data, offset, l, s.d_inner * dm),
            b1: init_param(data, offset, l, s.d_inner),
            w2: init_param(data, offset, l, dm * s.d_inner),
            b2: init_param(data, offset, l, dm),
            ln: init_param(data, offset, l, dm),
            ln_bias: init_param(data, offset, l, dm),
        }
    }
}

pub struct ModelWeights<'a> {
    pub src_emb: &'a [f32],
    pub trg_emb: &'a [f32],

    // Encoder
    pub enc_ln: &'a [f32],
    pub enc_ln_bias: &'a [f32],
    pub enc_attn: AttentionWeights<'a>,
    pub enc_ffn: FfnWeights<'a>,

    // Decoder
    pub dec_ln: &'a [f32],
    pub dec_ln_bias: &'a [f32],
    pub dec_self_attn: AttentionWeights<'a>,
    pub dec_enc_attn: AttentionWeights<'a>,
    pub dec_ffn: FfnWeights<'a>,

    pub trg_word_prj: &'a [f32],
}

impl<'a> ModelWeights<'a> {
    /// Views `data` as the parameters described by `s`. The length must match exactly.
    pub fn map(s: &ModelSettings, data: &'a [f32]) -> Result<ModelWeights<'a>> {
        let expected = s.n_params()?;
        if data.len() != expected {
            return Err(TranslateError::ShapeMismatch {
                expected: format!("{} parameters", expected),
                got: format!("{} parameters", data.len()),
            });
        }

        let dm = s.d_model;
        let mut offset: usize = 0;

        let trg_emb = init_param(data, &mut offset, s.trg_vocab_size, dm);
        let src_emb = if s.embs_share_weight {
            trg_emb
        } else {
            init_param(data, &mut offset, s.src_vocab_size, dm)
        };

        let enc_ln = init_param(data, &mut offset, 1, dm);
        let enc_ln_bias = init_param(data, &mut offset, 1, dm);
        let enc_attn = AttentionWeights::init(data, &mut offset, s);
        let enc_ffn = FfnWeights::init(data, &mut offset, s);

        let dec_ln = init_param(data, &mut offset, 1, dm);
        let dec_ln_bias = init_param(data, &mut offset, 1, dm);
        let dec_self_attn = AttentionWeights::init(data, &mut offset, s);
        let dec_enc_attn = AttentionWeights::init(data, &mut offset, s);
        let dec_ffn = FfnWeights::init(data, &mut offset, s);

        let trg_word_prj = if s.proj_share_weight {
            trg_emb
        } else {
            init_param(data, &mut offset, s.trg_vocab_size, dm)
        };

        debug_assert_eq!(offset, expected);

        Ok(ModelWeights {
            src_emb,
            trg_emb,
            enc_ln,
            enc_ln_bias,
            enc_attn,
            enc_ffn,
            dec_ln,
            dec_ln_bias,
            dec_self_attn,
            dec_enc_attn,
            dec_ffn,
            trg_word_prj,
        })
    }
}

/// A memory-mapped checkpoint file with its parsed settings.
pub struct Checkpoint {
    pub settings: ModelSettings,
    path: PathBuf,
    data: Mmap,
}

impl Checkpoint {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|source| TranslateError::FileRead {
            path: path.clone(),
            source,
        })?;
        let data = unsafe { Mmap::map(&file) }.map_err(|source| TranslateError::Mmap {
            path: path.clone(),
            source,
        })?;

        if data.len() < HEADER_SIZE {
            return Err(TranslateError::Corrupt {
                offset: data.len(),
                reason: format!("checkpoint shorter than its {} byte header", HEADER_SIZE),
            });
        }

        let settings = ModelSettings::parse(&data[..HEADER_SIZE])?;

        let payload = data.len() - HEADER_SIZE;
        if payload % 4 != 0 {
            return Err(TranslateError::ShapeMismatch {
                expected: format!("{} parameters", settings.n_params()?),
                got: format!("{} bytes", payload),
            });
        }

        Ok(Checkpoint { settings, path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn params(&self) -> Result<&[f32]> {
        u8_to_f32_slice(&self.data[HEADER_SIZE..])
    }

    pub fn weights(&self) -> Result<ModelWeights<'_>> {
        ModelWeights::map(&self.settings, self.params()?)
    }
}

/// Serializes `params` behind the header for `settings`. Shapes are not
/// checked here; `Checkpoint::open` followed by `weights` does that.
pub fn write_checkpoint<P: AsRef<Path>>(path: P, settings: &ModelSettings, params: &[f32]) -> Result<()> {
    let mut out: Vec<u8> = Vec::with_capacity(HEADER_SIZE + params.len() * 4);
    settings.write_header(&mut out);

    for p in params {
        out.extend_from_slice(&p.to_le_bytes());
    }

    fs::write(path.as_ref(), out).map_err(|source| TranslateError::FileWrite {
        path: path.as_ref().to_path_buf(),
        source,
    })
}
