//! Reader for the router's UCI configuration format.
//!
//! ```text
//! config dba 'dba'
//!     option enabled '1'
//!     option high_usage_threshold '85'
//!
//! config upload 'upload'
//!     option total_bandwidth '10mbit'
//!
//! config upload_class 'uclass_1'
//!     option name 'realtime'
//!     option percent_bandwidth '30'
//!     option min_bandwidth '1000'
//! ```
//!
//! Sections other than `dba`, `upload`, `download`, `upload_class` and `download_class` are
//! skipped, so a complete `qos_gargoyle` file (rules, global options) can be read as-is.

use crate::config::{parse_num, ClassConfig, ConfigError, LinkConfig, QosConfig, Result};

/// A `config <kind> ['<name>']` block and its options, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: String,
    pub name: Option<String>,
    pub options: Vec<(String, String)>,
    /// One-based line of the `config` statement.
    pub line: usize,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Splits UCI text into sections. `list` entries are kept as repeated options.
pub fn parse_sections(text: &str) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let words = split_words(raw).map_err(|message| ConfigError::Uci { line, message })?;

        let Some((keyword, rest)) = words.split_first() else { continue };

        match (keyword.as_str(), rest) {
            ("config", [kind]) => {
                sections.push(Section { kind: kind.clone(), name: None, options: vec![], line })
            }
            ("config", [kind, name]) => sections.push(Section {
                kind: kind.clone(),
                name: Some(name.clone()),
                options: vec![],
                line,
            }),
            ("option" | "list", [key, value]) => {
                let section = sections.last_mut().ok_or_else(|| ConfigError::Uci {
                    line,
                    message: format!("{keyword} outside of a config section"),
                })?;
                section.options.push((key.clone(), value.clone()));
            }
            ("package", [_]) => {}
            _ => {
                return Err(ConfigError::Uci {
                    line,
                    message: format!("unexpected statement {:?}", raw.trim()),
                })
            }
        }
    }

    Ok(sections)
}

/// Splits a line into words, honouring single and double quotes and `#` comments.
fn split_words(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        match chars.peek().copied() {
            None | Some('#') => break,
            Some(quote @ ('\'' | '"')) => {
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\\') if quote == '"' => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        Some(c) => word.push(c),
                        None => return Err(format!("unterminated {quote} quote")),
                    }
                }
                words.push(word);
            }
            Some(_) => {
                let mut word = String::new();
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    word.push(c);
                }
                words.push(word);
            }
        }
    }

    Ok(words)
}

pub(crate) fn parse_config(text: &str) -> Result<QosConfig> {
    let mut config = QosConfig::default();

    for section in parse_sections(text)? {
        match section.kind.as_str() {
            "dba" => {
                for (key, value) in &section.options {
                    config.dba.set(key, value)?;
                }
            }
            "upload" => apply_link(&mut config.upload, &section)?,
            "download" => apply_link(&mut config.download, &section)?,
            "upload_class" => config.upload.classes.push(class_from(&section)?),
            "download_class" => config.download.classes.push(class_from(&section)?),
            _ => {}
        }
    }

    Ok(config)
}

fn apply_link(link: &mut LinkConfig, section: &Section) -> Result<()> {
    for (key, value) in &section.options {
        match key.as_str() {
            "interface" => link.interface = Some(value.clone()),
            "total_bandwidth" => link.total_bandwidth = Some(value.parse()?),
            "root_class" => link.root_class = Some(value.clone()),
            _ => {}
        }
    }
    Ok(())
}

fn class_from(section: &Section) -> Result<ClassConfig> {
    let name = section
        .get("name")
        .or(section.name.as_deref())
        .ok_or_else(|| ConfigError::Uci { line: section.line, message: "class without a name".into() })?;

    let mut class = ClassConfig::new(name);
    for (key, value) in &section.options {
        match key.as_str() {
            "classid" => class.classid = Some(value.clone()),
            "priority" => class.priority = Some(parse_num(key, value)?),
            "percent_bandwidth" => class.percent_bandwidth = Some(parse_num(key, value)?),
            "min_bandwidth" => class.min_bandwidth = Some(value.parse()?),
            "max_bandwidth" => class.max_bandwidth = Some(value.parse()?),
            _ => {}
        }
    }
    Ok(class)
}
