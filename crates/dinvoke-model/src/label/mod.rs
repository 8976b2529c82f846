//! Include/exclude label expressions used to pick eligible workers.
//!
//! Grammar: tokens separated by ASCII whitespace (space, tab, CR, LF, vertical tab, form feed); a token starting with `!` excludes, any other token includes.
//! Excludes win over includes. An expression without includes accepts every token it does not exclude.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelExpr {
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl LabelExpr {
    /// Parse a label expression. Never fails: empty or blank input yields the match-all expression.
    pub fn parse(s: &str) -> Self {
        let mut expr = LabelExpr::default();
        for token in s.split(is_separator).filter(|t| !t.is_empty()) {
            match token.strip_prefix('!') {
                Some(excluded) => expr.excludes.push(excluded.to_string()),
                None => expr.includes.push(token.to_string()),
            }
        }
        expr
    }

    /// Returns `true` if `token` satisfies this expression.
    pub fn matches(&self, token: &str) -> bool {
        if self.excludes.iter().any(|e| e == token) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|i| i == token)
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    /// Returns `true` if the expression has no tokens at all.
    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }
}

fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0B' | '\x0C')
}

impl FromStr for LabelExpr {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(LabelExpr::parse(s))
    }
}

impl fmt::Display for LabelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let tokens = self
            .includes
            .iter()
            .map(|t| (false, t))
            .chain(self.excludes.iter().map(|t| (true, t)));

        for (negated, token) in tokens {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            if negated {
                f.write_str("!")?;
            }
            f.write_str(token)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(v: &[String]) -> Vec<String> {
        let mut v = v.to_vec();
        v.sort();
        v
    }

    #[test]
    fn exclude_takes_precedence() {
        let expr = LabelExpr::parse("MyName !MyName");
        assert_eq!(expr.includes().len(), 1);
        assert_eq!(expr.excludes().len(), 1);
        assert!(!expr.matches("MyName"));
    }

    #[test]
    fn multi_token_with_mixed_whitespace() {
        let expr = LabelExpr::parse("MyName\r\nis  Joel\tJohnson");
        assert_eq!(expr.includes().len(), 4);
        assert!(expr.excludes().is_empty());
        for token in ["MyName", "is", "Joel", "Johnson"] {
            assert!(expr.matches(token), "{token} should match");
        }
        assert!(!expr.matches("Other"));
    }

    #[test]
    fn only_ascii_whitespace_separates() {
        let e = LabelExpr::parse("gpu\u{00A0}linux \u{2003}arm");
        assert_eq!(e.includes().len(), 2);
        assert!(e.matches("gpu\u{00A0}linux"));
        assert!(e.matches("\u{2003}arm"));
        assert!(!e.matches("gpu"));
        assert!(!e.matches("linux"));

        let e = LabelExpr::parse("a\x0Bb\x0C!c");
        assert_eq!(e.includes(), ["a", "b"]);
        assert_eq!(e.excludes(), ["c"]);
    }

    #[test]
    fn empty_matches_everything() {
        for input in ["", "   \t\r\n "] {
            let expr = LabelExpr::parse(input);
            assert!(expr.is_empty());
            assert!(expr.matches("anything"));
            assert!(expr.matches(""));
        }
    }

    #[test]
    fn exclude_only() {
        let expr = LabelExpr::parse("!gpu !arm");
        assert!(expr.includes().is_empty());
        assert!(!expr.matches("gpu"));
        assert!(!expr.matches("arm"));
        assert!(expr.matches("x86"));
    }

    #[test]
    fn duplicates_do_not_change_behaviour() {
        let once = LabelExpr::parse("a !b");
        let twice = LabelExpr::parse("a a !b !b");
        for token in ["a", "b", "c"] {
            assert_eq!(once.matches(token), twice.matches(token));
        }
    }

    #[test]
    fn display_reparses_to_same_sets() {
        let expr = LabelExpr::parse("linux !arm\tgpu  !slow linux");
        let rendered = expr.to_string();
        assert_eq!(rendered, "linux gpu linux !arm !slow");

        let back: LabelExpr = rendered.parse().unwrap();
        assert_eq!(sorted(back.includes()), sorted(expr.includes()));
        assert_eq!(sorted(back.excludes()), sorted(expr.excludes()));
    }
}
