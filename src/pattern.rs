//! Pointcut patterns: glob class/method name matching and positional
//! parameter lists.
//!
//! Names are matched case-sensitively against fully qualified internal
//! (slash-form) names. `*` matches any character sequence, `|` separates
//! alternatives at the top level. Parameter lists match positionally against
//! friendly type names derived from the JVM method descriptor (`int`,
//! `long[]`, `java/lang/String`); a trailing `..` matches zero or more
//! remaining parameters of any type.

use crate::error::DescriptorError;

/// A compiled class- or method-name pattern.
#[derive(Debug, Clone)]
pub struct NamePattern {
    source: String,
    alternatives: Vec<Glob>,
}

#[derive(Debug, Clone)]
enum Glob {
    /// No `*` present.
    Literal(String),
    /// One or more `*`: anchored prefix, anchored suffix, ordered middles.
    Wild { prefix: String, suffix: String, middles: Vec<String> },
}

impl NamePattern {
    pub fn compile(source: &str) -> Result<Self, DescriptorError> {
        if source.is_empty() {
            return Err(DescriptorError::EmptyPattern);
        }
        let mut alternatives = Vec::new();
        for alt in source.split('|') {
            if alt.is_empty() {
                return Err(DescriptorError::EmptyPattern);
            }
            alternatives.push(Glob::compile(alt));
        }
        Ok(Self { source: source.to_string(), alternatives })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, name: &str) -> bool {
        self.alternatives.iter().any(|g| g.matches(name))
    }

    /// Leading literal run of the first alternative, used as the registry's
    /// cheap first-pass discriminator. `None` when the pattern starts with a
    /// wildcard or has multiple alternatives (those go in the catch-all
    /// bucket).
    pub fn literal_prefix(&self) -> Option<&str> {
        if self.alternatives.len() != 1 {
            return None;
        }
        match &self.alternatives[0] {
            Glob::Literal(s) => Some(s),
            Glob::Wild { prefix, .. } if !prefix.is_empty() => Some(prefix),
            _ => None,
        }
    }

    /// True when the pattern can never match a name lacking this method
    /// name; used by the thin-snapshot fast path.
    pub fn could_match_any(&self, names: impl Iterator<Item = impl AsRef<str>>) -> bool {
        let mut names = names;
        names.any(|n| self.matches(n.as_ref()))
    }
}

impl Glob {
    fn compile(pattern: &str) -> Self {
        if !pattern.contains('*') {
            return Glob::Literal(pattern.to_string());
        }
        let mut parts = pattern.split('*');
        let prefix = parts.next().unwrap_or("").to_string();
        let mut rest: Vec<&str> = parts.collect();
        let suffix = rest.pop().unwrap_or("").to_string();
        let middles = rest.iter().filter(|s| !s.is_empty()).map(|s| s.to_string()).collect();
        Glob::Wild { prefix, suffix, middles }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Glob::Literal(s) => s == name,
            Glob::Wild { prefix, suffix, middles } => {
                let Some(rest) = name.strip_prefix(prefix.as_str()) else {
                    return false;
                };
                let Some(mut rest) = rest.strip_suffix(suffix.as_str()) else {
                    return false;
                };
                for middle in middles {
                    match rest.find(middle.as_str()) {
                        Some(pos) => rest = &rest[pos + middle.len()..],
                        None => return false,
                    }
                }
                true
            }
        }
    }
}

/// A positional parameter-type pattern.
#[derive(Debug, Clone)]
pub struct ParamsPattern {
    types: Vec<String>,
    trailing_any: bool,
}

impl ParamsPattern {
    /// Compiles a parameter spec. Each element is a friendly type name; the
    /// literal `..` is only valid as the final element.
    pub fn compile(spec: &[String]) -> Result<Self, DescriptorError> {
        let mut types = Vec::with_capacity(spec.len());
        let mut trailing_any = false;
        for (i, t) in spec.iter().enumerate() {
            if t == ".." {
                if i + 1 != spec.len() {
                    return Err(DescriptorError::MisplacedParamWildcard);
                }
                trailing_any = true;
            } else {
                types.push(t.clone());
            }
        }
        Ok(Self { types, trailing_any })
    }

    /// Matches every possible parameter list.
    pub fn any() -> Self {
        Self { types: Vec::new(), trailing_any: true }
    }

    pub fn matches(&self, params: &[String]) -> bool {
        if self.trailing_any {
            params.len() >= self.types.len()
                && self.types.iter().zip(params).all(|(a, b)| a == b)
        } else {
            params.len() == self.types.len()
                && self.types.iter().zip(params).all(|(a, b)| a == b)
        }
    }
}

/// Parses a JVM method descriptor into friendly parameter type names and the
/// return type name.
pub fn parse_method_descriptor(desc: &str) -> Result<(Vec<String>, String), DescriptorError> {
    let bytes = desc.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(DescriptorError::InvalidMethodDescriptor(desc.to_string()));
    }
    let mut params = Vec::new();
    let mut i = 1;
    while i < bytes.len() && bytes[i] != b')' {
        let (name, next) = parse_type(desc, i)?;
        params.push(name);
        i = next;
    }
    if i >= bytes.len() {
        return Err(DescriptorError::InvalidMethodDescriptor(desc.to_string()));
    }
    let (ret, end) = parse_type(desc, i + 1)?;
    if end != bytes.len() {
        return Err(DescriptorError::InvalidMethodDescriptor(desc.to_string()));
    }
    Ok((params, ret))
}

fn parse_type(desc: &str, start: usize) -> Result<(String, usize), DescriptorError> {
    let bytes = desc.as_bytes();
    let mut dims = 0;
    let mut i = start;
    while i < bytes.len() && bytes[i] == b'[' {
        dims += 1;
        i += 1;
    }
    if i >= bytes.len() {
        return Err(DescriptorError::InvalidMethodDescriptor(desc.to_string()));
    }
    let (base, next) = match bytes[i] {
        b'B' => ("byte".to_string(), i + 1),
        b'C' => ("char".to_string(), i + 1),
        b'D' => ("double".to_string(), i + 1),
        b'F' => ("float".to_string(), i + 1),
        b'I' => ("int".to_string(), i + 1),
        b'J' => ("long".to_string(), i + 1),
        b'S' => ("short".to_string(), i + 1),
        b'Z' => ("boolean".to_string(), i + 1),
        b'V' => ("void".to_string(), i + 1),
        b'L' => {
            let semi = desc[i..]
                .find(';')
                .ok_or_else(|| DescriptorError::InvalidMethodDescriptor(desc.to_string()))?;
            (desc[i + 1..i + semi].to_string(), i + semi + 1)
        }
        _ => return Err(DescriptorError::InvalidMethodDescriptor(desc.to_string())),
    };
    let mut name = base;
    for _ in 0..dims {
        name.push_str("[]");
    }
    Ok((name, next))
}
