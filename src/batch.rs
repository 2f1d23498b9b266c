use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use tokenizers::pre_tokenizers::split::{Split, SplitPattern};
use tokenizers::{
    OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer, SplitDelimiterBehavior,
};

use crate::vocab::{Vocab, BOS, EOS, PAD};

/// Words, with inner hyphens kept (`кто-то`), or runs of punctuation.
const WORD_PATTERN: &str = r"\w+(?:-\w+)*|[^\w\s]+";

/// Lower-cases `text` and splits it into word and punctuation tokens.
///
/// Hyphenated words stay whole; whitespace is dropped.
pub fn tokenize(text: &str) -> Result<Vec<String>> {
    let mut pretokenized = PreTokenizedString::from(text.to_lowercase());
    // Inverted: the pattern's matches are the tokens, everything between them is removed.
    Split::new(
        SplitPattern::Regex(WORD_PATTERN.to_string()),
        SplitDelimiterBehavior::Removed,
        true,
    )
    .map_err(anyhow::Error::msg)?
    .pre_tokenize(&mut pretokenized)
    .map_err(anyhow::Error::msg)?;
    let words = pretokenized
        .get_splits(OffsetReferential::Original, OffsetType::Byte)
        .into_iter()
        .map(|(word, _, _)| word.to_string())
        .collect();
    Ok(words)
}

/// Lays out `max_len` ids as `PAD.. BOS tokens.. EOS`.
///
/// Only the first `max_len - 2` tokens fit; the rest are dropped.
pub fn encode_row<S: AsRef<str>>(tokens: &[S], vocab: &Vocab, max_len: usize) -> Result<Vec<u32>> {
    ensure!(max_len >= 2, "max_len must leave room for BOS and EOS, got {max_len}");
    let room = max_len - 2;
    if tokens.len() > room {
        tracing::warn!(tokens = tokens.len(), kept = room, "truncating row");
    }
    let content: Vec<u32> = tokens
        .iter()
        .take(room)
        .map(|token| vocab.id(token.as_ref()))
        .collect();

    let mut row = vec![PAD; max_len - content.len() - 2];
    row.push(BOS);
    row.extend(content);
    row.push(EOS);
    Ok(row)
}

pub struct Batch {
    /// `(batch, max_len)` token ids.
    pub inputs: Tensor,
    /// Same ids as `inputs`.
    pub targets: Tensor,
}

impl Batch {
    pub fn from_texts<S: AsRef<str>>(
        texts: &[S],
        vocab: &Vocab,
        max_len: usize,
        device: &Device,
    ) -> Result<Self> {
        ensure!(!texts.is_empty(), "cannot build an empty batch");
        let mut ids = Vec::with_capacity(texts.len() * max_len);
        for text in texts {
            let tokens = tokenize(text.as_ref())?;
            ids.extend(encode_row(&tokens, vocab, max_len)?);
        }
        let inputs = Tensor::from_vec(ids, (texts.len(), max_len), device)?;
        let targets = inputs.clone();
        Ok(Self { inputs, targets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::UNK;

    #[test]
    fn tokenize_lowercases_and_splits_punctuation() -> Result<()> {
        assert_eq!(tokenize("Мама мыла раму")?, vec!["мама", "мыла", "раму"]);
        assert_eq!(tokenize("Привет, мир!")?, vec!["привет", ",", "мир", "!"]);
        assert!(tokenize("   ")?.is_empty());
        Ok(())
    }

    #[test]
    fn tokenize_keeps_hyphenated_words() -> Result<()> {
        assert_eq!(
            tokenize("Кто-то мыл раму -- опять.")?,
            vec!["кто-то", "мыл", "раму", "--", "опять", "."]
        );
        Ok(())
    }

    #[test]
    fn row_layout_pads_before_bos() -> Result<()> {
        let vocab = Vocab::demo();
        let tokens = tokenize("Мама мыла раму")?;
        let row = encode_row(&tokens, &vocab, 32)?;
        assert_eq!(row.len(), 32);
        assert_eq!(row[31], EOS);
        assert_eq!(&row[28..31], &[0, 2, 3]);
        assert_eq!(row[27], BOS);
        assert!(row[..27].iter().all(|id| *id == PAD));
        Ok(())
    }

    #[test]
    fn unknown_words_become_unk() -> Result<()> {
        let vocab = Vocab::demo();
        let row = encode_row(&tokenize("мама неизвестное")?, &vocab, 6)?;
        assert_eq!(row, vec![PAD, PAD, BOS, 0, UNK, EOS]);
        Ok(())
    }

    #[test]
    fn long_rows_are_truncated() -> Result<()> {
        let vocab = Vocab::demo();
        let tokens = ["мама", "мыла", "раму", "текст"];
        let row = encode_row(&tokens, &vocab, 4)?;
        assert_eq!(row, vec![BOS, 0, 2, EOS]);
        assert!(encode_row(&tokens, &vocab, 1).is_err());
        Ok(())
    }

    #[test]
    fn batch_tensors_have_fixed_width() -> Result<()> {
        let vocab = Vocab::demo();
        let texts = ["Мама мыла раму", "Компьютер сгенерировал длинный текст"];
        let batch = Batch::from_texts(&texts, &vocab, 32, &Device::Cpu)?;
        assert_eq!(batch.inputs.dims(), &[2, 32]);
        let rows = batch.inputs.to_vec2::<u32>()?;
        assert_eq!(&rows[1][26..], &[BOS, 1, 5, 6, 4, EOS]);
        assert_eq!(rows, batch.targets.to_vec2::<u32>()?);
        Ok(())
    }
}
