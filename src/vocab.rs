use std::collections::HashMap;

pub const PAD: u32 = 0;
pub const BOS: u32 = 1;
pub const EOS: u32 = 2;
pub const UNK: u32 = 3;

/// Words of the demo corpus, in id order.
pub const DEMO_WORDS: [&str; 7] = [
    "мама",
    "компьютер",
    "мыла",
    "раму",
    "текст",
    "сгенерировал",
    "длинный",
];

/// Static word -> id mapping. Words keep their position in the source list as
/// their id, so ids of the first words coincide with the reserved ids.
#[derive(Clone, Debug, Default)]
pub struct Vocab {
    token2idx: HashMap<String, u32>,
}

impl Vocab {
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut token2idx = HashMap::new();
        for (idx, word) in words.into_iter().enumerate() {
            token2idx.entry(word.into()).or_insert(idx as u32);
        }
        Self { token2idx }
    }

    pub fn demo() -> Self {
        Self::from_words(DEMO_WORDS)
    }

    /// Unknown words map to [`UNK`].
    pub fn id(&self, word: &str) -> u32 {
        self.token2idx.get(word).copied().unwrap_or(UNK)
    }

    pub fn len(&self) -> usize {
        self.token2idx.len()
    }
}
