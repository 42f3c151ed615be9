use regex::Regex;

/// Group id compiled for matching kstat names.
///
/// The id is anchored, so `sys` only matches `sys` while `zone_\d+` matches
/// every zone group. Plain ids are also available through [`literal`] so
/// sources can use a direct lookup instead of scanning.
///
/// [`literal`]: GroupPattern::literal
#[derive(Debug, Clone)]
pub struct GroupPattern {
    source: String,
    regex: Regex,
    literal: bool,
}

impl GroupPattern {
    /// Compiles a group id.
    pub fn new(id: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{})$", id))?;
        Ok(Self {
            source: id.to_string(),
            regex,
            literal: !id.contains(is_pattern_syntax),
        })
    }

    /// Returns the id as written in the schema.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns the id if it contains no pattern syntax.
    pub fn literal(&self) -> Option<&str> {
        self.literal.then_some(self.source.as_str())
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

fn is_pattern_syntax(c: char) -> bool {
    matches!(
        c,
        '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
    )
}

impl std::fmt::Display for GroupPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}
