use crate::beam::Seq2Seq;
use crate::checkpoint::{AttentionWeights, Checkpoint, FfnWeights, ModelSettings, ModelWeights};
use crate::error::{Result, TranslateError};
use crate::functional::{add_in_place, dot, layer_norm, log_softmax, matmul, relu, softmax};

use rayon::prelude::*;

const LAYER_NORM_EPS: f32 = 1e-6;

/// Encoder states for one source sentence.
pub struct EncoderOutput {
    hidden: Vec<f32>,
    len: usize,
    // false where the source holds padding
    src_mask: Vec<bool>,
}

impl EncoderOutput {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Post-norm encoder-decoder transformer, inference only. Weights are
/// borrowed from the checkpoint mapping.
pub struct Transformer<'a> {
    args: ModelSettings,
    weights: ModelWeights<'a>,
    pos_table: Vec<f32>,
    x_logit_scale: f32,
}

fn sinusoid_table(n_position: usize, d_hid: usize) -> Vec<f32> {
    let mut table = vec![0.0f32; n_position * d_hid];

    for pos in 0..n_position {
        for j in 0..d_hid {
            let angle = pos as f64 / 10000f64.powf(2.0 * (j / 2) as f64 / d_hid as f64);
            let value = if j % 2 == 0 { angle.sin() } else { angle.cos() };
            table[pos * d_hid + j] = value as f32;
        }
    }

    table
}

impl<'a> Transformer<'a> {
    pub fn new(checkpoint: &'a Checkpoint) -> Result<Transformer<'a>> {
        Transformer::from_weights(checkpoint.settings, checkpoint.weights()?)
    }

    pub fn from_weights(args: ModelSettings, weights: ModelWeights<'a>) -> Result<Transformer<'a>> {
        args.validate()?;

        let x_logit_scale = if args.proj_share_weight {
            (args.d_model as f32).powf(-0.5)
        } else {
            1.0
        };

        Ok(Transformer {
            pos_table: sinusoid_table(args.n_position, args.d_model),
            args,
            weights,
            x_logit_scale,
        })
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.args
    }

    fn check_len(&self, what: &str, len: usize) -> Result<()> {
        if len == 0 {
            return Err(TranslateError::InvalidConfig(format!("empty {} sequence", what)));
        }
        if len > self.args.n_position {
            return Err(TranslateError::InvalidConfig(format!(
                "{} length {} exceeds the model's {} positions",
                what, len, self.args.n_position
            )));
        }
        Ok(())
    }

    /// Embedding lookup plus positional encoding, followed by the stack's input norm.
    fn embed(&self, tokens: &[u32], table: &[f32], vocab_size: usize, ln: &[f32], ln_bias: &[f32]) -> Result<Vec<f32>> {
        let dm = self.args.d_model;
        let mut x = vec![0.0f32; tokens.len() * dm];

        for (t, &token) in tokens.iter().enumerate() {
            if token as usize >= vocab_size {
                return Err(TranslateError::UnknownIndex(token));
            }

            let row = &mut x[t * dm..(t + 1) * dm];
            row.copy_from_slice(&table[token as usize * dm..(token as usize + 1) * dm]);
            add_in_place(row, &self.pos_table[t * dm..(t + 1) * dm]);

            let e = row.to_vec();
            layer_norm(row, &e, ln, ln_bias, LAYER_NORM_EPS);
        }

        Ok(x)
    }

    /// Multi-head attention of `x` over `xkv` for layer `l`, then residual and norm in place.
    /// `visible(t, s)` says whether query `t` may attend to key `s`.
    fn attention<F>(&self, x: &mut [f32], xkv: &[f32], w: &AttentionWeights, l: usize, visible: F)
    where
        F: Fn(usize, usize) -> bool + Sync,
    {
        let p = &self.args;
        let dm = p.d_model;
        let (n_head, d_k, d_v) = (p.n_head, p.d_k, p.d_v);
        let hk = n_head * d_k;
        let hv = n_head * d_v;
        let len_q = x.len() / dm;
        let len_k = xkv.len() / dm;

        let wq = &w.wq[l * hk * dm..(l + 1) * hk * dm];
        let wk = &w.wk[l * hk * dm..(l + 1) * hk * dm];
        let wv = &w.wv[l * hv * dm..(l + 1) * hv * dm];
        let wo = &w.wo[l * dm * hv..(l + 1) * dm * hv];

        let mut q = vec![0.0f32; len_q * hk];
        let mut k = vec![0.0f32; len_k * hk];
        let mut v = vec![0.0f32; len_k * hv];

        for t in 0..len_q {
            matmul(&mut q[t * hk..(t + 1) * hk], &x[t * dm..(t + 1) * dm], wq);
        }
        for s in 0..len_k {
            matmul(&mut k[s * hk..(s + 1) * hk], &xkv[s * dm..(s + 1) * dm], wk);
            matmul(&mut v[s * hv..(s + 1) * hv], &xkv[s * dm..(s + 1) * dm], wv);
        }

        let temperature = (d_k as f32).sqrt();
        let mut ctx = vec![0.0f32; len_q * hv];

        ctx.par_chunks_mut(hv).enumerate().for_each(|(t, ctx_t)| {
            let mut att = vec![0.0f32; len_k];

            for h in 0..n_head {
                let q_h = &q[t * hk + h * d_k..t * hk + (h + 1) * d_k];

                for (s, a) in att.iter_mut().enumerate() {
                    *a = if visible(t, s) {
                        dot(q_h, &k[s * hk + h * d_k..s * hk + (h + 1) * d_k]) / temperature
                    } else {
                        f32::NEG_INFINITY
                    };
                }

                // Nothing visible: leave this head's context at zero.
                if !att.iter().any(|a| a.is_finite()) {
                    continue;
                }

                softmax(&mut att);

                let out = &mut ctx_t[h * d_v..(h + 1) * d_v];
                for (s, a) in att.iter().enumerate() {
                    if *a == 0.0 {
                        continue;
                    }
                    let v_s = &v[s * hv + h * d_v..s * hv + (h + 1) * d_v];
                    for j in 0..d_v {
                        out[j] += a * v_s[j];
                    }
                }
            }
        });

        let ln = &w.ln[l * dm..(l + 1) * dm];
        let ln_bias = &w.ln_bias[l * dm..(l + 1) * dm];
        let mut o = vec![0.0f32; dm];

        for t in 0..len_q {
            matmul(&mut o, &ctx[t * hv..(t + 1) * hv], wo);
            let row = &mut x[t * dm..(t + 1) * dm];
            add_in_place(&mut o, row);
            layer_norm(row, &o, ln, ln_bias, LAYER_NORM_EPS);
        }
    }

    fn feed_forward(&self, x: &mut [f32], w: &FfnWeights, l: usize) {
        let dm = self.args.d_model;
        let di = self.args.d_inner;

        let w1 = &w.w1[l * di * dm..(l + 1) * di * dm];
        let b1 = &w.b1[l * di..(l + 1) * di];
        let w2 = &w.w2[l * dm * di..(l + 1) * dm * di];
        let b2 = &w.b2[l * dm..(l + 1) * dm];
        let ln = &w.ln[l * dm..(l + 1) * dm];
        let ln_bias = &w.ln_bias[l * dm..(l + 1) * dm];

        let mut hidden = vec![0.0f32; di];
        let mut o = vec![0.0f32; dm];

        for row in x.chunks_mut(dm) {
            matmul(&mut hidden, row, w1);
            add_in_place(&mut hidden, b1);
            relu(&mut hidden);

            matmul(&mut o, &hidden, w2);
            add_in_place(&mut o, b2);
            add_in_place(&mut o, row);

            layer_norm(row, &o, ln, ln_bias, LAYER_NORM_EPS);
        }
    }

    pub fn forward_encoder(&self, source: &[u32]) -> Result<EncoderOutput> {
        self.check_len("source", source.len())?;

        let p = &self.args;
        let w = &self.weights;

        let mut x = self.embed(source, w.src_emb, p.src_vocab_size, w.enc_ln, w.enc_ln_bias)?;
        let src_mask: Vec<bool> = source.iter().map(|&t| t != p.src_pad_idx).collect();

        for l in 0..p.n_layers {
            let kv = x.clone();
            self.attention(&mut x, &kv, &w.enc_attn, l, |_, s| src_mask[s]);
            self.feed_forward(&mut x, &w.enc_ffn, l);
        }

        Ok(EncoderOutput {
            hidden: x,
            len: source.len(),
            src_mask,
        })
    }

    /// Log-probabilities of the token following `prefix`.
    pub fn forward_decoder(&self, enc: &EncoderOutput, prefix: &[u32]) -> Result<Vec<f32>> {
        self.check_len("target", prefix.len())?;

        let p = &self.args;
        let w = &self.weights;
        let dm = p.d_model;

        let mut y = self.embed(prefix, w.trg_emb, p.trg_vocab_size, w.dec_ln, w.dec_ln_bias)?;

        for l in 0..p.n_layers {
            let kv = y.clone();
            self.attention(&mut y, &kv, &w.dec_self_attn, l, |t, s| s <= t);
            self.attention(&mut y, &enc.hidden, &w.dec_enc_attn, l, |_, s| enc.src_mask[s]);
            self.feed_forward(&mut y, &w.dec_ffn, l);
        }

        let last = &y[(prefix.len() - 1) * dm..prefix.len() * dm];
        let mut logits = vec![0.0f32; p.trg_vocab_size];
        matmul(&mut logits, last, w.trg_word_prj);

        if self.x_logit_scale != 1.0 {
            for v in logits.iter_mut() {
                *v *= self.x_logit_scale;
            }
        }

        log_softmax(&mut logits);

        Ok(logits)
    }
}

impl<'a> Seq2Seq for Transformer<'a> {
    type Encoded = EncoderOutput;

    fn vocab_size(&self) -> usize {
        self.args.trg_vocab_size
    }

    fn encode(&self, source: &[u32]) -> Result<EncoderOutput> {
        self.forward_encoder(source)
    }

    fn decode_step(&self, encoded: &EncoderOutput, prefix: &[u32]) -> Result<Vec<f32>> {
        self.forward_decoder(encoded, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ModelSettings {
        ModelSettings {
            src_vocab_size: 11,
            trg_vocab_size: 13,
            src_pad_idx: 0,
            trg_pad_idx: 0,
            d_word_vec: 12,
            d_model: 12,
            d_inner: 20,
            d_k: 5,
            d_v: 3,
            n_layers: 2,
            n_head: 3,
            n_position: 16,
            dropout: 0.1,
            embs_share_weight: false,
            proj_share_weight: true,
        }
    }

    fn params(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i * 7919 % 1000) as f32 / 1000.0 - 0.5) * 0.4).collect()
    }

    #[test]
    fn decoder_yields_normalized_log_probs() {
        let s = settings();
        let data = params(s.n_params().unwrap());
        let model = Transformer::from_weights(s, ModelWeights::map(&s, &data).unwrap()).unwrap();

        let enc = model.encode(&[4, 5, 6, 3]).unwrap();
        assert_eq!(enc.len(), 4);

        let lp = model.decode_step(&enc, &[2, 7]).unwrap();
        assert_eq!(lp.len(), 13);

        let total: f32 = lp.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(lp.iter().all(|v| v.is_finite() && *v <= 0.0));
    }

    #[test]
    fn source_padding_is_ignored() {
        let s = settings();
        let data = params(s.n_params().unwrap());
        let model = Transformer::from_weights(s, ModelWeights::map(&s, &data).unwrap()).unwrap();

        let plain = model.encode(&[4, 5, 3]).unwrap();
        let padded = model.encode(&[4, 5, 3, 0, 0]).unwrap();

        let a = model.decode_step(&plain, &[2]).unwrap();
        let b = model.decode_step(&padded, &[2]).unwrap();

        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn decode_step_is_a_function_of_the_prefix() {
        let s = settings();
        let data = params(s.n_params().unwrap());
        let model = Transformer::from_weights(s, ModelWeights::map(&s, &data).unwrap()).unwrap();
        let enc = model.encode(&[4, 5, 3]).unwrap();

        let short = model.decode_step(&enc, &[2]).unwrap();
        let again = model.decode_step(&enc, &[2]).unwrap();
        assert_eq!(short, again);

        let longer = model.decode_step(&enc, &[2, 9, 9]).unwrap();
        assert_ne!(short, longer);
    }

    #[test]
    fn rejects_out_of_range_inputs() {
        let s = settings();
        let data = params(s.n_params().unwrap());
        let model = Transformer::from_weights(s, ModelWeights::map(&s, &data).unwrap()).unwrap();

        assert!(matches!(model.encode(&[]), Err(TranslateError::InvalidConfig(_))));
        assert!(matches!(model.encode(&[4, 99]), Err(TranslateError::UnknownIndex(99))));

        let enc = model.encode(&[4, 3]).unwrap();
        let too_long = vec![2u32; 17];
        assert!(matches!(
            model.decode_step(&enc, &too_long),
            Err(TranslateError::InvalidConfig(_))
        ));
    }

    #[test]
    fn settings_describe_the_loaded_shape() {
        let s = settings();
        let data = params(s.n_params().unwrap());
        let model = Transformer::from_weights(s, ModelWeights::map(&s, &data).unwrap()).unwrap();

        assert_eq!(model.settings(), &s);
        assert_eq!(model.settings().trg_vocab_size, model.vocab_size());
    }
}
