use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use airgap_core::{Error, Result};

/// Encode `texts` into `[B, max_len]` id and mask tensors.
///
/// Every row is truncated or padded to exactly `max_len`, so a text's
/// encoding never depends on what else is in the batch.
pub fn tokenize_batch(
    tokenizer: &Tokenizer,
    texts: &[String],
    max_len: usize,
    pad_id: u32,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut ids = Vec::with_capacity(texts.len() * max_len);
    let mut mask = Vec::with_capacity(texts.len() * max_len);
    for text in texts {
        let enc = tokenizer
            .encode(text.as_str(), true)
            .map_err(|e| Error::EmbeddingUnavailable(format!("tokenization failed: {e}")))?;
        let mut row_ids = enc.get_ids().to_vec();
        let mut row_mask = enc.get_attention_mask().to_vec();
        row_ids.truncate(max_len);
        row_mask.truncate(max_len);
        let pad = max_len - row_ids.len();
        row_ids.extend(std::iter::repeat(pad_id).take(pad));
        row_mask.extend(std::iter::repeat(0).take(pad));
        ids.extend(row_ids);
        mask.extend(row_mask);
    }
    let shape = (texts.len(), max_len);
    let input_ids = Tensor::from_vec(ids, shape, device).map_err(crate::candle_err)?;
    let attention_mask = Tensor::from_vec(mask, shape, device).map_err(crate::candle_err)?;
    Ok((input_ids, attention_mask))
}
