use std::collections::BTreeMap;
use std::path::Path;

/// Maps a detector class index to its human-readable label.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassNameTable {
    names: Vec<String>,
}

impl ClassNameTable {
    pub fn new(names: Vec<String>) -> Result<Self, ClassNameError> {
        if names.is_empty() {
            return Err(ClassNameError::Empty);
        }
        Ok(Self { names })
    }

    /// Load the table once at startup.
    pub fn load(path: &Path) -> Result<Self, ClassNameError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Accepts a JSON array of names, a JSON object of `"index": "name"`,
    /// or one name per line (darknet `.names` style).
    pub fn parse(text: &str) -> Result<Self, ClassNameError> {
        let trimmed = text.trim_start();

        if trimmed.starts_with('[') {
            let names: Vec<String> = serde_json::from_str(trimmed)?;
            return Self::new(names);
        }

        if trimmed.starts_with('{') {
            let map: BTreeMap<String, String> = serde_json::from_str(trimmed)?;
            let mut indexed = BTreeMap::new();
            for (key, name) in map {
                let index: usize = key
                    .trim()
                    .parse()
                    .map_err(|_| ClassNameError::InvalidIndex(key.clone()))?;
                indexed.insert(index, name);
            }
            let mut names = Vec::with_capacity(indexed.len());
            for (position, (index, name)) in indexed.into_iter().enumerate() {
                if index != position {
                    return Err(ClassNameError::MissingIndex(position));
                }
                names.push(name);
            }
            return Self::new(names);
        }

        let names = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self::new(names)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassNameError {
    #[error("Failed to read class names: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse class names: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Class index is not an integer: {0}")]
    InvalidIndex(String),

    #[error("Class names skip index {0}")]
    MissingIndex(usize),

    #[error("Class name table is empty")]
    Empty,
}
