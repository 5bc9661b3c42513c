//! Form parameters.
//!
//! The panel is a plain value: each interaction produces a new [`PanelState`]
//! which is later passed by value into a download request.
//!
//! Theme and type are derived from the category but stay editable. Picking a
//! new category only re-derives a field the user has not typed into.

use serde::{Deserialize, Serialize};

use crate::catalog::{Category, FileFormat, DEFAULT_RELEASE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelState {
    pub category: Category,
    pub file_format: FileFormat,
    pub version: String,
    pub theme: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub theme_edited: bool,
    #[serde(default)]
    pub type_edited: bool,
}

/// A single edit coming from the form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum PanelChange {
    Category(Category),
    FileFormat(FileFormat),
    Version(String),
    Theme(String),
    Type(String),
}

impl Default for PanelState {
    fn default() -> Self {
        Self::new(DEFAULT_RELEASE)
    }
}

impl PanelState {
    pub fn new(version: impl Into<String>) -> Self {
        let category = Category::default();
        Self {
            category,
            file_format: FileFormat::default(),
            version: version.into(),
            theme: category.theme().to_string(),
            kind: category.as_str().to_string(),
            theme_edited: false,
            type_edited: false,
        }
    }

    pub fn apply(self, change: PanelChange) -> Self {
        match change {
            PanelChange::Category(c) => self.with_category(c),
            PanelChange::FileFormat(f) => self.with_file_format(f),
            PanelChange::Version(v) => self.with_version(v),
            PanelChange::Theme(t) => self.with_theme(t),
            PanelChange::Type(t) => self.with_type(t),
        }
    }

    pub fn with_category(self, category: Category) -> Self {
        let theme = if self.theme_edited {
            self.theme
        } else {
            category.theme().to_string()
        };
        let kind = if self.type_edited {
            self.kind
        } else {
            category.as_str().to_string()
        };
        Self {
            category,
            theme,
            kind,
            ..self
        }
    }

    pub fn with_file_format(self, file_format: FileFormat) -> Self {
        Self { file_format, ..self }
    }

    pub fn with_version(self, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..self
        }
    }

    /// An empty value hands the field back to the category default.
    pub fn with_theme(self, theme: impl Into<String>) -> Self {
        let theme = theme.into();
        if theme.trim().is_empty() {
            return Self {
                theme: self.category.theme().to_string(),
                theme_edited: false,
                ..self
            };
        }
        Self {
            theme_edited: theme != self.category.theme(),
            theme,
            ..self
        }
    }

    pub fn with_type(self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Self {
                kind: self.category.as_str().to_string(),
                type_edited: false,
                ..self
            };
        }
        Self {
            type_edited: kind != self.category.as_str(),
            kind,
            ..self
        }
    }
}
