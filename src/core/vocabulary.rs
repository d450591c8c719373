use std::collections::HashMap;

/// Reserved id marking the boundary of a text: it is the context for the first
/// character of a corpus and, when sampled, it ends a continuation.
pub const BOUNDARY_TOKEN_ID: usize = 0;

#[derive(Clone, Debug)]
pub struct TokenVocabulary {
    token_to_id: HashMap<char, usize>,
    id_to_token: Vec<char>,
}

impl TokenVocabulary {
    pub fn new(tokens: Vec<char>) -> Self {
        let mut token_to_id = HashMap::new();
        for (i, token) in tokens.iter().enumerate() {
            token_to_id.insert(*token, i);
        }
        TokenVocabulary {
            token_to_id,
            id_to_token: tokens,
        }
    }

    pub fn size(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn id(&self, token: char) -> Option<usize> {
        self.token_to_id.get(&token).copied()
    }

    pub fn token(&self, id: usize) -> Option<char> {
        self.id_to_token.get(id).copied()
    }

    /// Characters outside the vocabulary are dropped.
    pub fn tokenize(&self, text: &str) -> Vec<usize> {
        text.chars().filter_map(|c| self.id(c)).collect()
    }

    pub fn detokenize(&self, ids: &[usize]) -> String {
        ids.iter()
            .filter(|&&id| id != BOUNDARY_TOKEN_ID)
            .filter_map(|&id| self.token(id))
            .collect()
    }
}

impl Default for TokenVocabulary {
    fn default() -> Self {
        let standard_vocabulary = vec![
            '▶', // boundary
            '\n', ' ', '!', '"', '#', '$', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
            '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', '@',
            'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q',
            'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '[', '\\', ']', '^', '_', '`', 'a', 'b',
            'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
            't', 'u', 'v', 'w', 'x', 'y', 'z', '{', '|', '}', '—',
        ];
        Self::new(standard_vocabulary)
    }
}
