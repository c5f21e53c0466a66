/// Declares one output field a probe module can produce. The set of
/// definitions is part of a module's public contract and never changes
/// between runs.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub ftype: &'static str,
    pub desc: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Uint(u64),
    Str(&'static str),
    String(String),
    Bool(bool),
    None,
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Uint(v) => write!(f, "{}", v),
            FieldValue::Str(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", *v as u8),
            FieldValue::None => Ok(()),
        }
    }
}

/// An ordered name -> value mapping produced for one classified response.
/// Built fresh per packet and handed to the output layer; holds no
/// cross-packet state.
#[derive(Debug, Default)]
pub struct FieldSet {
    fields: Vec<(&'static str, FieldValue)>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn add(&mut self, name: &'static str, value: FieldValue) {
        self.fields.push((name, value));
    }

    pub fn add_uint(&mut self, name: &'static str, value: u64) {
        self.add(name, FieldValue::Uint(value));
    }

    pub fn add_bool(&mut self, name: &'static str, value: bool) {
        self.add(name, FieldValue::Bool(value));
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, FieldValue)> {
        self.fields.iter()
    }

    /// One CSV record in declaration order, no header.
    pub fn to_csv(&self) -> String {
        self.fields
            .iter()
            .map(|(_, v)| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fieldset_preserves_order() {
        let mut fs = FieldSet::new();
        fs.add("classification", FieldValue::Str("synack"));
        fs.add_bool("success", true);
        fs.add_uint("sport", 443);
        let names: Vec<_> = fs.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["classification", "success", "sport"]);
        assert_eq!(fs.to_csv(), "synack,1,443");
    }

    #[test]
    fn test_fieldset_get() {
        let mut fs = FieldSet::new();
        fs.add_uint("acknum", 7);
        assert_eq!(fs.get("acknum"), Some(&FieldValue::Uint(7)));
        assert_eq!(fs.get("seqnum"), None);
    }
}
