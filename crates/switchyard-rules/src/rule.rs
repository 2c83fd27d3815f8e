//! Rule expression parsing and normalization.
//!
//! A rule such as ``Host(`a.example.com`) && (PathPrefix(`/api`) || Path(`/health`))``
//! is expanded into disjunctive normal form: a list of [`MatchClause`]s, each
//! holding the host patterns and path matches a request must satisfy.
//! Matchers that do not restrict host or path (`Method`, `Header`, negations,
//! ...) leave the clause unconstrained, which biases overlap checks toward
//! reporting a collision rather than missing one.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::RuleError;

/// Upper bound on DNF clauses produced by a single rule.
const MAX_CLAUSES: usize = 64;

/// Upper bound on nested parentheses and negations.
const MAX_DEPTH: usize = 32;

/// Upper bound on matchers in a single rule.
const MAX_MATCHERS: usize = 256;

/// Matchers accepted but ignored for overlap purposes.
const NEUTRAL_MATCHERS: &[&str] = &[
    "Method",
    "Header",
    "HeaderRegexp",
    "Query",
    "QueryRegexp",
    "ClientIP",
    "ALPN",
    "PathRegexp",
];

/// A host constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HostPattern {
    /// A literal host, lowercased, port stripped.
    Exact(String),
    /// `*.example.com`, stored as the suffix `example.com`.
    Wildcard(String),
    /// Any host (`HostRegexp`, ``HostSNI(`*`)``).
    Any,
}

impl HostPattern {
    /// Parse a single host argument.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut host = raw.trim().to_ascii_lowercase();
        if let Some((name, port)) = host.rsplit_once(':') {
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                host = name.to_string();
            }
        }

        if host.is_empty() {
            return Err("host is empty".to_string());
        }
        if host == "*" {
            return Ok(Self::Any);
        }
        if let Some(suffix) = host.strip_prefix("*.") {
            validate_labels(suffix)?;
            return Ok(Self::Wildcard(suffix.to_string()));
        }
        if host.contains('*') {
            return Err(format!("wildcard must be a leading '*.' label: {}", raw));
        }
        validate_labels(&host)?;
        Ok(Self::Exact(host))
    }

    /// Whether a concrete host name is matched by this pattern.
    pub fn matches_host(&self, host: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(h) => h == host,
            Self::Wildcard(suffix) => is_subdomain(host, suffix),
        }
    }

    /// Whether some host could be matched by both patterns.
    pub fn overlaps(&self, other: &HostPattern) -> bool {
        match (self, other) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Exact(host), wildcard @ Self::Wildcard(_))
            | (wildcard @ Self::Wildcard(_), Self::Exact(host)) => wildcard.matches_host(host),
            (Self::Wildcard(a), Self::Wildcard(b)) => {
                a == b || is_subdomain(a, b) || is_subdomain(b, a)
            }
        }
    }

    /// The narrower of two overlapping patterns, `None` if disjoint.
    fn intersect(&self, other: &HostPattern) -> Option<HostPattern> {
        if !self.overlaps(other) {
            return None;
        }
        let narrower = match (self, other) {
            (Self::Any, x) | (x, Self::Any) => x,
            (Self::Exact(_), _) => self,
            (_, Self::Exact(_)) => other,
            (Self::Wildcard(a), Self::Wildcard(b)) => {
                if a.len() >= b.len() {
                    self
                } else {
                    other
                }
            }
        };
        Some(narrower.clone())
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(h) => write!(f, "{}", h),
            Self::Wildcard(suffix) => write!(f, "*.{}", suffix),
            Self::Any => write!(f, "*"),
        }
    }
}

/// A path constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PathMatch {
    /// `Path(...)`: the request path must be equal.
    Exact(String),
    /// `PathPrefix(...)`: the request path must start with it.
    Prefix(String),
}

impl PathMatch {
    fn parse(matcher: &str, raw: &str) -> Result<Self, RuleError> {
        if !raw.starts_with('/') {
            return Err(RuleError::InvalidArgument {
                matcher: matcher.to_string(),
                message: format!("path must start with '/': {}", raw),
            });
        }
        if matcher == "Path" {
            Ok(Self::Exact(raw.to_string()))
        } else {
            Ok(Self::Prefix(raw.to_string()))
        }
    }

    /// The path literal.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(p) | Self::Prefix(p) => p,
        }
    }

    /// Whether some request path could be matched by both.
    pub fn overlaps(&self, other: &PathMatch) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Exact(path), Self::Prefix(prefix)) | (Self::Prefix(prefix), Self::Exact(path)) => {
                path.starts_with(prefix.as_str())
            }
            (Self::Prefix(a), Self::Prefix(b)) => a.starts_with(b.as_str()) || b.starts_with(a.as_str()),
        }
    }

    fn intersect(&self, other: &PathMatch) -> Option<PathMatch> {
        if !self.overlaps(other) {
            return None;
        }
        let narrower = match (self, other) {
            (Self::Exact(_), _) => self,
            (_, Self::Exact(_)) => other,
            (Self::Prefix(a), Self::Prefix(b)) => {
                if a.len() >= b.len() {
                    self
                } else {
                    other
                }
            }
        };
        Some(narrower.clone())
    }
}

impl fmt::Display for PathMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(p) => write!(f, "{}", p),
            Self::Prefix(p) => write!(f, "{}*", p),
        }
    }
}

/// One conjunction of host and path constraints. Empty means unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchClause {
    pub hosts: Vec<HostPattern>,
    pub paths: Vec<PathMatch>,
}

impl MatchClause {
    /// `None` when neither side restricts the host (a path-only comparison).
    pub fn hosts_overlap(&self, other: &MatchClause) -> Option<bool> {
        match (self.hosts.is_empty(), other.hosts.is_empty()) {
            (true, true) => None,
            (true, false) | (false, true) => Some(true),
            (false, false) => Some(
                self.hosts
                    .iter()
                    .any(|a| other.hosts.iter().any(|b| a.overlaps(b))),
            ),
        }
    }

    /// Path overlap, treating an unconstrained side as `/`.
    pub fn paths_overlap(&self, other: &MatchClause) -> bool {
        if self.paths.is_empty() || other.paths.is_empty() {
            return true;
        }
        self.paths
            .iter()
            .any(|a| other.paths.iter().any(|b| a.overlaps(b)))
    }

    fn conjoin(&self, other: &MatchClause) -> Option<MatchClause> {
        let hosts = conjoin_constraints(&self.hosts, &other.hosts, HostPattern::intersect)?;
        let paths = conjoin_constraints(&self.paths, &other.paths, PathMatch::intersect)?;
        Some(MatchClause { hosts, paths })
    }
}

fn conjoin_constraints<T: Clone + Ord>(
    left: &[T],
    right: &[T],
    intersect: fn(&T, &T) -> Option<T>,
) -> Option<Vec<T>> {
    if left.is_empty() {
        return Some(right.to_vec());
    }
    if right.is_empty() {
        return Some(left.to_vec());
    }
    let merged: BTreeSet<T> = left
        .iter()
        .flat_map(|a| right.iter().filter_map(move |b| intersect(a, b)))
        .collect();
    if merged.is_empty() {
        None
    } else {
        Some(merged.into_iter().collect())
    }
}

/// A parsed, normalized routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub clauses: Vec<MatchClause>,
    /// The rule matches on TLS SNI (`HostSNI`), so it routes TCP.
    pub sni: bool,
}

impl RuleMatch {
    /// Parse a rule expression.
    pub fn parse(rule: &str) -> Result<Self, RuleError> {
        if rule.trim().is_empty() {
            return Err(RuleError::Empty);
        }
        let tokens = tokenize(rule)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            matchers: 0,
            sni: false,
        };
        let expr = parser.parse_or()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(RuleError::Syntax {
                offset: *offset,
                message: format!("unexpected {}", token.describe()),
            });
        }

        let clauses = expand(&expr)?;
        if clauses.is_empty() {
            return Err(RuleError::Unsatisfiable);
        }
        Ok(Self {
            clauses,
            sni: parser.sni,
        })
    }

    /// All host patterns mentioned by any clause.
    pub fn hosts(&self) -> Vec<HostPattern> {
        let set: BTreeSet<&HostPattern> = self.clauses.iter().flat_map(|c| &c.hosts).collect();
        set.into_iter().cloned().collect()
    }

    /// All path matches mentioned by any clause.
    pub fn paths(&self) -> Vec<PathMatch> {
        let set: BTreeSet<&PathMatch> = self.clauses.iter().flat_map(|c| &c.paths).collect();
        set.into_iter().cloned().collect()
    }

    /// True when no clause restricts the host.
    pub fn is_path_only(&self) -> bool {
        self.clauses.iter().all(|c| c.hosts.is_empty())
    }

    /// Host names a certificate would have to cover (`Any` excluded).
    pub fn certificate_domains(&self) -> Vec<String> {
        self.hosts()
            .into_iter()
            .filter(|h| !matches!(h, HostPattern::Any))
            .map(|h| h.to_string())
            .collect()
    }
}

fn validate_labels(host: &str) -> Result<(), String> {
    for label in host.split('.') {
        if label.is_empty() {
            return Err(format!("empty label in host: {}", host));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(format!("invalid character in host: {}", host));
        }
    }
    Ok(())
}

/// `host` is strictly below `suffix` (`a.example.com` under `example.com`).
fn is_subdomain(host: &str, suffix: &str) -> bool {
    host.len() > suffix.len() + 1
        && host.ends_with(suffix)
        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{}'", name),
            Token::Str(s) => format!("string `{}`", s),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
            Token::Not => "'!'".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, RuleError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push((offset, Token::LParen));
            }
            ')' => {
                chars.next();
                tokens.push((offset, Token::RParen));
            }
            ',' => {
                chars.next();
                tokens.push((offset, Token::Comma));
            }
            '!' => {
                chars.next();
                tokens.push((offset, Token::Not));
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        tokens.push((offset, if c == '&' { Token::And } else { Token::Or }));
                    }
                    _ => {
                        return Err(RuleError::Syntax {
                            offset,
                            message: format!("expected '{}{}'", c, c),
                        })
                    }
                }
            }
            '`' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                for (_, ch) in chars.by_ref() {
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                }
                if !closed {
                    return Err(RuleError::Syntax {
                        offset,
                        message: "unterminated string".to_string(),
                    });
                }
                tokens.push((offset, Token::Str(value)));
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((offset, Token::Ident(ident)));
            }
            other => {
                return Err(RuleError::Syntax {
                    offset,
                    message: format!("unexpected character '{}'", other),
                })
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Expr {
    Matcher { name: String, args: Vec<String> },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
    matchers: usize,
    sni: bool,
}

impl Parser {
    fn descend(&mut self) -> Result<(), RuleError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(RuleError::TooLarge(format!(
                "nesting deeper than {} levels",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .or_else(|| self.tokens.last().map(|(o, _)| *o + 1))
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), RuleError> {
        let offset = self.offset();
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(RuleError::Syntax {
                offset,
                message: format!("expected {}, found {}", expected.describe(), token.describe()),
            }),
            None => Err(RuleError::Syntax {
                offset,
                message: format!("expected {}, found end of rule", expected.describe()),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, RuleError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, RuleError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, RuleError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Not) => {
                self.descend()?;
                let inner = self.parse_unary()?;
                self.depth -= 1;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                self.matchers += 1;
                if self.matchers > MAX_MATCHERS {
                    return Err(RuleError::TooLarge(format!(
                        "more than {} matchers",
                        MAX_MATCHERS
                    )));
                }
                if name == "HostSNI" {
                    self.sni = true;
                }
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        let arg_offset = self.offset();
                        match self.next() {
                            Some(Token::Str(value)) => args.push(value),
                            other => {
                                return Err(RuleError::Syntax {
                                    offset: arg_offset,
                                    message: format!(
                                        "expected string argument, found {}",
                                        other
                                            .map(|t| t.describe())
                                            .unwrap_or_else(|| "end of rule".to_string())
                                    ),
                                })
                            }
                        }
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Matcher { name, args })
            }
            Some(token) => Err(RuleError::Syntax {
                offset,
                message: format!("expected matcher, found {}", token.describe()),
            }),
            None => Err(RuleError::Syntax {
                offset,
                message: "expected matcher, found end of rule".to_string(),
            }),
        }
    }
}

fn expand(expr: &Expr) -> Result<Vec<MatchClause>, RuleError> {
    let clauses = match expr {
        Expr::Matcher { name, args } => vec![matcher_clause(name, args)?],
        // Negation cannot narrow an overlap check; treat it as unconstrained
        // once the negated matchers are known to be valid.
        Expr::Not(inner) => {
            expand(inner)?;
            vec![MatchClause::default()]
        }
        Expr::Or(left, right) => {
            let mut clauses = expand(left)?;
            clauses.extend(expand(right)?);
            clauses
        }
        Expr::And(left, right) => {
            let left = expand(left)?;
            let right = expand(right)?;
            if left.len() * right.len() > MAX_CLAUSES {
                return Err(RuleError::TooComplex(left.len() * right.len()));
            }
            left.iter()
                .flat_map(|a| right.iter().filter_map(move |b| a.conjoin(b)))
                .collect()
        }
    };

    if clauses.len() > MAX_CLAUSES {
        return Err(RuleError::TooComplex(clauses.len()));
    }
    Ok(clauses)
}

fn matcher_clause(name: &str, args: &[String]) -> Result<MatchClause, RuleError> {
    let invalid = |message: String| RuleError::InvalidArgument {
        matcher: name.to_string(),
        message,
    };

    match name {
        "Host" | "HostSNI" => {
            if args.is_empty() {
                return Err(invalid("at least one host is required".to_string()));
            }
            let hosts: BTreeSet<HostPattern> = args
                .iter()
                .map(|a| HostPattern::parse(a).map_err(&invalid))
                .collect::<Result<_, _>>()?;
            Ok(MatchClause {
                hosts: hosts.into_iter().collect(),
                paths: vec![],
            })
        }
        "HostRegexp" => Ok(MatchClause {
            hosts: vec![HostPattern::Any],
            paths: vec![],
        }),
        "Path" | "PathPrefix" => {
            if args.is_empty() {
                return Err(invalid("at least one path is required".to_string()));
            }
            let paths: BTreeSet<PathMatch> = args
                .iter()
                .map(|a| PathMatch::parse(name, a))
                .collect::<Result<_, _>>()?;
            Ok(MatchClause {
                hosts: vec![],
                paths: paths.into_iter().collect(),
            })
        }
        other if NEUTRAL_MATCHERS.contains(&other) => Ok(MatchClause::default()),
        other => Err(invalid(format!("unknown matcher '{}'", other))),
    }
}
