//! Task archiver library for line-oriented Markdown outlines.
//! Modules keep the tree work pure: parsing, extraction, merging and formatting never
//! touch storage; only `archiver` talks to a `storage::Vault`.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    /* ------------------------------- IDs ------------------------------- */

    /// Index of a node inside its owning `Document` arena.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(pub usize);

    /* ------------------------------ Entities ------------------------------ */

    /// Shape of a node. Containers (`Root`, `Section`, `Content`) own children;
    /// leaves (`ListItem`, `Text`) carry literal text.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum NodeKind {
        /// Virtual depth-0 section; `content` holds everything before the first heading.
        Root { content: NodeId },
        /// A heading and the body below it. `children` holds nested sections only.
        Section { content: NodeId },
        /// Structural holder of a section's body.
        Content,
        ListItem,
        Text,
    }

    /// One node of the outline tree.
    ///
    /// `parent` is a non-owning back link; ownership runs strictly through `children`
    /// (and through `NodeKind::{Root, Section}::content` for content holders).
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Node {
        pub kind: NodeKind,
        /// Literal line text: heading markers or list markers included, indentation stripped.
        pub text: Option<String>,
        /// Heading depth for sections, indentation-derived level for leaves, 0 for holders.
        pub level: usize,
        pub parent: Option<NodeId>,
        #[serde(default)]
        pub children: Vec<NodeId>,
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one parsed document, stored as an arena of nodes.
    ///
    /// Detached nodes stay in the arena until the document is dropped; only nodes
    /// reachable from `root` are serialized.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Document {
        root: NodeId,
        nodes: Vec<Node>,
    }

    impl Default for Document {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Document {
        pub fn new() -> Self {
            let mut doc = Self {
                root: NodeId(0),
                nodes: vec![],
            };
            let content = doc.alloc(NodeKind::Content, None, 0);
            let root = doc.alloc(NodeKind::Root { content }, None, 0);
            doc.nodes[content.0].parent = Some(root);
            doc.root = root;
            doc
        }

        pub fn root(&self) -> NodeId {
            self.root
        }

        /// Number of allocated nodes, detached ones included.
        pub fn node_count(&self) -> usize {
            self.nodes.len()
        }

        pub fn node(&self, id: NodeId) -> &Node {
            &self.nodes[id.0]
        }

        pub fn kind(&self, id: NodeId) -> NodeKind {
            self.nodes[id.0].kind
        }

        pub fn text(&self, id: NodeId) -> Option<&str> {
            self.nodes[id.0].text.as_deref()
        }

        pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
            self.nodes[id.0].text = Some(text.into());
        }

        pub fn level(&self, id: NodeId) -> usize {
            self.nodes[id.0].level
        }

        pub fn parent(&self, id: NodeId) -> Option<NodeId> {
            self.nodes[id.0].parent
        }

        pub fn children(&self, id: NodeId) -> &[NodeId] {
            &self.nodes[id.0].children
        }

        /// Content holder of a root or section.
        pub fn content_of(&self, id: NodeId) -> Option<NodeId> {
            match self.kind(id) {
                NodeKind::Root { content } | NodeKind::Section { content } => Some(content),
                _ => None,
            }
        }

        pub fn is_section(&self, id: NodeId) -> bool {
            matches!(self.kind(id), NodeKind::Root { .. } | NodeKind::Section { .. })
        }

        pub fn is_container(&self, id: NodeId) -> bool {
            matches!(
                self.kind(id),
                NodeKind::Root { .. } | NodeKind::Section { .. } | NodeKind::Content
            )
        }

        /* --------------------------- Construction --------------------------- */

        fn alloc(&mut self, kind: NodeKind, text: Option<String>, level: usize) -> NodeId {
            let id = NodeId(self.nodes.len());
            self.nodes.push(Node {
                kind,
                text,
                level,
                parent: None,
                children: vec![],
            });
            id
        }

        /// Allocate a detached section (with its content holder) for a heading line.
        pub fn new_section(&mut self, heading: impl Into<String>, depth: usize) -> NodeId {
            let content = self.alloc(NodeKind::Content, None, 0);
            let section = self.alloc(NodeKind::Section { content }, Some(heading.into()), depth);
            self.nodes[content.0].parent = Some(section);
            section
        }

        pub fn new_list_item(&mut self, text: impl Into<String>, level: usize) -> NodeId {
            self.alloc(NodeKind::ListItem, Some(text.into()), level)
        }

        pub fn new_text(&mut self, text: impl Into<String>, level: usize) -> NodeId {
            self.alloc(NodeKind::Text, Some(text.into()), level)
        }

        /* ----------------------------- Mutation ----------------------------- */

        /// Append `child` as the last child of `parent`, detaching it first.
        pub fn append(&mut self, parent: NodeId, child: NodeId) {
            self.detach(child);
            self.nodes[parent.0].children.push(child);
            self.nodes[child.0].parent = Some(parent);
        }

        /// Unlink `id` from its parent. The node keeps its own children.
        pub fn detach(&mut self, id: NodeId) {
            if let Some(parent) = self.nodes[id.0].parent.take() {
                self.nodes[parent.0].children.retain(|c| *c != id);
            }
        }

        /// Walk up from `from` until reaching a node whose level is below `level`.
        ///
        /// Never leaves the enclosing content holder: an indentation that implies walking
        /// past it is treated as top-level.
        pub fn climb_below_level(&self, from: NodeId, level: usize) -> NodeId {
            let mut pointer = from;
            while self.level(pointer) >= level && !self.is_container(pointer) {
                match self.parent(pointer) {
                    Some(parent) => pointer = parent,
                    None => break,
                }
            }
            pointer
        }

        /// Move the subtree under `id` so that `id` sits at `level`, keeping the
        /// relative levels of its descendants.
        pub fn relevel(&mut self, id: NodeId, level: usize) {
            let delta = level as isize - self.level(id) as isize;
            if delta == 0 {
                return;
            }
            for node in self.subtree(id) {
                let floor = match self.kind(node) {
                    NodeKind::Text => 3,
                    _ => 2,
                };
                let shifted = (self.level(node) as isize + delta).max(floor as isize);
                self.nodes[node.0].level = shifted as usize;
            }
        }

        /* ----------------------------- Traversal ----------------------------- */

        /// `id` and all of its descendants in document order.
        pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
            let mut out = Vec::new();
            let mut stack = vec![id];
            while let Some(next) = stack.pop() {
                out.push(next);
                for child in self.children(next).iter().rev() {
                    stack.push(*child);
                }
                if let Some(content) = self.content_of(next) {
                    stack.push(content);
                }
            }
            out
        }

        /// The node that produces the last emitted line under `id`, if any.
        pub fn last_line(&self, id: NodeId) -> Option<NodeId> {
            let mut pointer = id;
            loop {
                if let Some(last) = self.children(pointer).last() {
                    pointer = *last;
                    continue;
                }
                if let Some(content) = self.content_of(pointer) {
                    if let Some(last) = self.children(content).last() {
                        pointer = *last;
                        continue;
                    }
                }
                return self.text(pointer).map(|_| pointer);
            }
        }

        /// Deep-copy a subtree owned by `other` into this arena. The copy is detached.
        pub fn transplant(&mut self, other: &Document, id: NodeId) -> NodeId {
            let source = other.node(id);
            let copy = match source.kind {
                NodeKind::Root { .. } | NodeKind::Section { .. } => {
                    let text = source.text.clone().unwrap_or_default();
                    self.new_section(text, source.level)
                }
                kind => self.alloc(kind, source.text.clone(), source.level),
            };
            if let (Some(from), Some(to)) = (other.content_of(id), self.content_of(copy)) {
                for child in other.children(from) {
                    let child_copy = self.transplant(other, *child);
                    self.append(to, child_copy);
                }
            }
            for child in other.children(id) {
                let child_copy = self.transplant(other, *child);
                self.append(copy, child_copy);
            }
            copy
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum ArchiveError {
        #[error("the archiver works only in markdown (.md) files, got {0:?}")]
        UnsupportedDocument(PathBuf),
        #[error("{0:?} is not a valid markdown file")]
        TargetConflict(PathBuf),
        #[error("there is no active document")]
        NoActiveDocument,
        #[error("I/O error on {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("invalid settings: {0}")]
        InvalidSettings(String),
        #[error("invalid date format {0:?}")]
        InvalidDateFormat(String),
        #[error("invalid text replacement pattern: {0}")]
        InvalidPattern(#[from] regex::Error),
        #[error("heading template {0:?} cannot be nested under a list item")]
        HeadingUnderListItem(String),
        #[error("heading template {heading:?} would sit at depth {depth}")]
        HeadingTooDeep { heading: String, depth: usize },
    }

    pub type Result<T> = std::result::Result<T, ArchiveError>;

}

pub mod settings {
    //! User-facing configuration, loaded from JSON with every field defaulted.

    use crate::core::{ArchiveError, Result};
    use crate::placeholders::format_date;
    use crate::projectors::date_tree_merger::ContainerTemplate;
    use serde::{Deserialize, Serialize};

    /// Deepest heading Markdown recognizes.
    pub const MAX_HEADING_DEPTH: usize = 6;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ArchiverSettings {
        /// Heading text of the archive section (matched as a prefix after the `#` markers).
        pub archive_heading: String,
        pub archive_heading_depth: usize,
        pub archive_to_separate_file: bool,
        /// File name template for the separate archive; `%` is the source file's base name.
        pub default_archive_file_name: String,
        pub add_newlines_around_headings: bool,
        /// Default chrono format for `{{date}}`.
        pub date_format: String,
        pub archive_under_headings: bool,
        pub headings: Vec<TemplateSettings>,
        pub archive_under_list_items: bool,
        pub list_items: Vec<TemplateSettings>,
        pub task_sort_order: TaskSortOrder,
        pub sort_alphabetically: bool,
        /// Treat `[>]`, `[-]`, etc. as completed, not only `[x]`.
        pub archive_all_checked_task_types: bool,
        pub text_replacement: TextReplacement,
        pub additional_metadata_before_archiving: MetadataSettings,
        pub indentation_settings: IndentationSettings,
        pub rules: Vec<ArchiveRule>,
    }

    impl Default for ArchiverSettings {
        fn default() -> Self {
            Self {
                archive_heading: "Archived".into(),
                archive_heading_depth: 1,
                archive_to_separate_file: false,
                default_archive_file_name: "% (archive)".into(),
                add_newlines_around_headings: true,
                date_format: "%Y-%m-%d".into(),
                archive_under_headings: false,
                headings: vec![TemplateSettings::new("{{date}}")],
                archive_under_list_items: false,
                list_items: vec![TemplateSettings::new("[[{{date}}]]")],
                task_sort_order: TaskSortOrder::NewestLast,
                sort_alphabetically: false,
                archive_all_checked_task_types: false,
                text_replacement: TextReplacement::default(),
                additional_metadata_before_archiving: MetadataSettings::default(),
                indentation_settings: IndentationSettings::default(),
                rules: vec![],
            }
        }
    }

    /// One level of the archive hierarchy. `date_format` overrides the global one.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TemplateSettings {
        pub text: String,
        #[serde(default)]
        pub date_format: Option<String>,
    }

    impl TemplateSettings {
        pub fn new(text: impl Into<String>) -> Self {
            Self {
                text: text.into(),
                date_format: None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum TaskSortOrder {
        #[default]
        NewestLast,
        NewestFirst,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TextReplacement {
        pub apply_replacement: bool,
        pub regex: String,
        pub replacement: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct MetadataSettings {
        pub add_metadata: bool,
        pub metadata: String,
        pub date_format: Option<String>,
    }

    impl Default for MetadataSettings {
        fn default() -> Self {
            Self {
                add_metadata: false,
                metadata: "(archived {{date}})".into(),
                date_format: None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct IndentationSettings {
        pub use_tab: bool,
        pub tab_size: usize,
    }

    impl Default for IndentationSettings {
        fn default() -> Self {
            Self {
                use_tab: false,
                tab_size: 2,
            }
        }
    }

    /// Route tasks with particular status characters to their own destination.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ArchiveRule {
        /// Status characters this rule claims, e.g. `">-"`.
        pub statuses: String,
        pub default_archive_file_name: String,
        pub date_format: String,
        pub archive_to_separate_file: bool,
    }

    impl Default for ArchiveRule {
        fn default() -> Self {
            Self {
                statuses: String::new(),
                default_archive_file_name: String::new(),
                date_format: "%Y-%m-%d".into(),
                archive_to_separate_file: true,
            }
        }
    }

    impl ArchiverSettings {
        pub fn from_json(text: &str) -> Result<Self> {
            serde_json::from_str(text).map_err(|e| ArchiveError::InvalidSettings(e.to_string()))
        }

        pub fn validate(&self) -> Result<()> {
            if !(1..=MAX_HEADING_DEPTH).contains(&self.archive_heading_depth) {
                return Err(ArchiveError::InvalidSettings(format!(
                    "archive heading depth {} is out of bounds (1..={MAX_HEADING_DEPTH})",
                    self.archive_heading_depth
                )));
            }
            if self.archive_heading.trim().is_empty() {
                return Err(ArchiveError::InvalidSettings(
                    "archive heading cannot be empty".into(),
                ));
            }
            if self.indentation_settings.tab_size == 0 {
                return Err(ArchiveError::InvalidSettings("tab size must be positive".into()));
            }
            if self.archive_under_headings {
                let deepest = self.archive_heading_depth + self.headings.len();
                if deepest > MAX_HEADING_DEPTH {
                    return Err(ArchiveError::InvalidSettings(format!(
                        "heading templates would reach depth {deepest}, deeper than {MAX_HEADING_DEPTH}"
                    )));
                }
            }
            let sample = chrono::NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(chrono::NaiveDate::MIN);
            format_date(sample, &self.date_format)?;
            for format in self
                .headings
                .iter()
                .chain(&self.list_items)
                .filter_map(|t| t.date_format.as_deref())
                .chain(self.additional_metadata_before_archiving.date_format.as_deref())
                .chain(self.rules.iter().map(|r| r.date_format.as_str()))
                .filter(|f| !f.is_empty())
            {
                format_date(sample, format)?;
            }
            if self.text_replacement.apply_replacement {
                regex::Regex::new(&self.text_replacement.regex)?;
            }
            Ok(())
        }

        /// Heading templates followed by list-item templates. Each heading nests one
        /// level below the section it is created in.
        pub fn container_chain(&self) -> Vec<ContainerTemplate> {
            let mut chain = Vec::new();
            if self.archive_under_headings {
                for heading in &self.headings {
                    chain.push(ContainerTemplate::Heading {
                        text: heading.text.clone(),
                        date_format: heading.date_format.clone(),
                    });
                }
            }
            if self.archive_under_list_items {
                for item in &self.list_items {
                    chain.push(ContainerTemplate::ListItem {
                        text: item.text.clone(),
                        date_format: item.date_format.clone(),
                    });
                }
            }
            chain
        }

        /// The rule claiming `status`, if any.
        pub fn rule_for_status(&self, status: char) -> Option<&ArchiveRule> {
            self.rules.iter().find(|r| r.statuses.contains(status))
        }

        /// Whether a task with this checkbox character gets archived at all.
        pub fn is_archivable_status(&self, status: char) -> bool {
            status == 'x'
                || (self.archive_all_checked_task_types && status != ' ')
                || self.rule_for_status(status).is_some()
        }
    }

}

pub mod placeholders {
    //! `{{name}}` substitution for templates.

    use crate::core::{ArchiveError, Result};
    use chrono::NaiveDate;
    use chrono::format::{Item, StrftimeItems};
    use indexmap::IndexMap;
    use std::fmt::Write;

    pub const DATE: &str = "{{date}}";
    pub const SOURCE_FILE_NAME: &str = "{{sourceFileName}}";
    pub const SOURCE_PATH: &str = "{{sourcePath}}";
    pub const HEADING: &str = "{{heading}}";

    /// Values available to templates during one archive run.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PlaceholderContext {
        pub date: NaiveDate,
        pub date_format: String,
        pub source_file_name: String,
        pub source_path: String,
        /// Closest heading above the task, markers stripped.
        pub heading: Option<String>,
    }

    impl PlaceholderContext {
        pub fn new(date: NaiveDate, date_format: impl Into<String>) -> Self {
            Self {
                date,
                date_format: date_format.into(),
                source_file_name: String::new(),
                source_path: String::new(),
                heading: None,
            }
        }

        pub fn with_source(mut self, file_name: impl Into<String>, path: impl Into<String>) -> Self {
            self.source_file_name = file_name.into();
            self.source_path = path.into();
            self
        }

        pub fn with_heading(&self, heading: Option<&str>) -> Self {
            Self {
                heading: heading.map(str::to_string),
                ..self.clone()
            }
        }

        pub fn with_date_format(&self, date_format: &str) -> Self {
            Self {
                date_format: date_format.to_string(),
                ..self.clone()
            }
        }

        /// Substitute every known placeholder in `template`. An empty or missing
        /// `date_format` falls back to the context's format.
        pub fn resolve(&self, template: &str, date_format: Option<&str>) -> Result<String> {
            let mut values: IndexMap<&str, String> = IndexMap::new();
            if template.contains(DATE) {
                let format = date_format
                    .filter(|f| !f.is_empty())
                    .unwrap_or(&self.date_format);
                values.insert(DATE, format_date(self.date, format)?);
            }
            values.insert(SOURCE_FILE_NAME, self.source_file_name.clone());
            values.insert(SOURCE_PATH, self.source_path.clone());
            values.insert(
                HEADING,
                self.heading
                    .clone()
                    .unwrap_or_else(|| self.source_file_name.clone()),
            );

            let mut out = template.to_string();
            for (key, value) in &values {
                out = out.replace(key, value);
            }
            Ok(out)
        }
    }

    /// Format `date` with a chrono strftime string, rejecting unknown or time-only specifiers.
    pub fn format_date(date: NaiveDate, format: &str) -> Result<String> {
        let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            return Err(ArchiveError::InvalidDateFormat(format.to_string()));
        }
        let mut out = String::new();
        write!(out, "{}", date.format_with_items(items.into_iter()))
            .map_err(|_| ArchiveError::InvalidDateFormat(format.to_string()))?;
        Ok(out)
    }

}

pub mod parser {
    //! Line-oriented Markdown outline parser built on `nom`.
    //!
    //! Parsing never fails: a line that is neither a heading, a list item nor an indented
    //! continuation is kept verbatim as a top-level text line.
    //! Strategy:
    //! - Heading lines split the document into a section tree by `#` depth (stack build).
    //! - Each section body is classified line by line into flat leaves tagged with a level.
    //! - The flat leaves are re-hung under their list-item ancestors by a level walk.

    use crate::core::*;
    use crate::settings::{IndentationSettings, MAX_HEADING_DEPTH};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1},
        character::complete::{anychar, char, digit1, one_of, satisfy},
        combinator::recognize,
        multi::{many_m_n, many0, many1},
        sequence::{pair, tuple},
    };
    use tracing::debug;

    /// Level of an unindented text line.
    pub const TOP_LEVEL: usize = 1;
    /// Level of an unindented list item; each indentation unit adds one.
    pub const BASE_ITEM_LEVEL: usize = 2;

    type PResult<'a, T> = IResult<&'a str, T>;

    /* ------------------------------ Flat leaves ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LeafKind {
        ListItem,
        Text,
    }

    /// A classified line: its text with the indentation prefix removed, and its level.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FlatLeaf {
        pub kind: LeafKind,
        pub text: String,
        pub level: usize,
    }

    /* ------------------------------- Combinators ------------------------------- */

    fn indent_unit(i: &str) -> PResult<'_, &str> {
        alt((tag("  "), tag("\t")))(i)
    }

    fn indentation(i: &str) -> PResult<'_, &str> {
        recognize(many0(indent_unit))(i)
    }

    /// `-`, `*` or `12.`
    fn list_marker(i: &str) -> PResult<'_, &str> {
        alt((recognize(one_of("-*")), recognize(pair(digit1, char('.')))))(i)
    }

    /// Indentation, marker and one whitespace character. Returns the indentation.
    fn list_item_prefix(i: &str) -> PResult<'_, &str> {
        let (rest, indent) = indentation(i)?;
        let (rest, _) = list_marker(rest)?;
        let (rest, _) = satisfy(char::is_whitespace)(rest)?;
        Ok((rest, indent))
    }

    /// Indentation of a continuation line: one or more units followed by anything but `-`.
    ///
    /// When the greedy indentation runs into a `-` (or the end of the line), the last unit is
    /// given back so the line still counts as indented text.
    fn indented_line_prefix(line: &str) -> Option<&str> {
        let (rest, units) = many1(indent_unit)(line).ok()?;
        let width = line.len() - rest.len();
        match rest.chars().next() {
            Some(c) if c != '-' => Some(&line[..width]),
            _ if units.len() >= 2 => {
                let last = units.last().map_or(0, |u| u.len());
                Some(&line[..width - last])
            }
            _ => None,
        }
    }

    fn heading_marker(i: &str) -> PResult<'_, Vec<char>> {
        let (rest, hashes) = many_m_n(1, MAX_HEADING_DEPTH, char('#'))(i)?;
        let (rest, _) = take_while1(char::is_whitespace)(rest)?;
        Ok((rest, hashes))
    }

    fn task_checkbox(i: &str) -> PResult<'_, char> {
        let (rest, (_, _, _, status, _)) =
            tuple((list_marker, char(' '), char('['), anychar, char(']')))(i)?;
        Ok((rest, status))
    }

    /* ------------------------------ Line helpers ------------------------------ */

    /// Depth of a heading line (`# ` .. `###### `), `None` for anything else.
    pub fn heading_depth(line: &str) -> Option<usize> {
        heading_marker(line).ok().map(|(_, hashes)| hashes.len())
    }

    /// Heading text without its `#` markers.
    pub fn heading_title(line: &str) -> Option<&str> {
        heading_marker(line).ok().map(|(rest, _)| rest.trim_end())
    }

    /// Whether `line` is a heading whose title starts with `title`.
    pub fn is_heading_titled(line: &str, title: &str) -> bool {
        heading_title(line).is_some_and(|t| t.starts_with(title))
    }

    /// Checkbox character of a task line (`- [x] done` gives `x`). Expects the
    /// indentation to be stripped already.
    pub fn task_status(text: &str) -> Option<char> {
        task_checkbox(text).ok().map(|(_, status)| status)
    }

    /// Level of a line indented by `indentation`.
    pub fn level_for_indentation(indentation: &str, settings: &IndentationSettings) -> usize {
        let units = if settings.use_tab {
            indentation.chars().count()
        } else {
            indentation.len().div_ceil(settings.tab_size.max(1))
        };
        units + BASE_ITEM_LEVEL
    }

    /* ---------------------------- Flat classification ---------------------------- */

    pub fn classify_line(line: &str, settings: &IndentationSettings) -> FlatLeaf {
        if let Ok((_, indent)) = list_item_prefix(line) {
            return FlatLeaf {
                kind: LeafKind::ListItem,
                text: line[indent.len()..].to_string(),
                level: level_for_indentation(indent, settings),
            };
        }
        if let Some(indent) = indented_line_prefix(line) {
            return FlatLeaf {
                kind: LeafKind::Text,
                text: line[indent.len()..].to_string(),
                level: level_for_indentation(indent, settings),
            };
        }
        FlatLeaf {
            kind: LeafKind::Text,
            text: line.to_string(),
            level: TOP_LEVEL,
        }
    }

    pub fn classify_lines<S: AsRef<str>>(lines: &[S], settings: &IndentationSettings) -> Vec<FlatLeaf> {
        lines
            .iter()
            .map(|line| classify_line(line.as_ref(), settings))
            .collect()
    }

    /* ------------------------------- Tree building ------------------------------- */

    /// Hang `leaves` under `holder`, recovering list nesting from levels.
    ///
    /// The attachment point starts at `holder`. A list item climbs from the attachment
    /// point to the nearest node with a lower level (`stepsUp + 1` links when levels are
    /// consecutive), attaches there and becomes the new attachment point. A top-level
    /// text line resets the attachment point; nested text attaches without moving it.
    ///
    /// After an indentation jump the climb still compares levels instead of counting
    /// `stepsUp + 1` links: levels `2, 4, 3` put the level-3 item under the level-2
    /// item, not at the holder.
    pub fn build_tree(doc: &mut Document, holder: NodeId, leaves: Vec<FlatLeaf>) {
        let mut context = holder;
        for leaf in leaves {
            match leaf.kind {
                LeafKind::ListItem => {
                    let item = doc.new_list_item(leaf.text, leaf.level);
                    if doc.level(context) >= leaf.level {
                        context = doc.climb_below_level(context, leaf.level);
                    }
                    doc.append(context, item);
                    context = item;
                }
                LeafKind::Text if leaf.level == TOP_LEVEL => {
                    let line = doc.new_text(leaf.text, leaf.level);
                    context = holder;
                    doc.append(context, line);
                }
                LeafKind::Text => {
                    let line = doc.new_text(leaf.text, leaf.level);
                    doc.append(context, line);
                }
            }
        }
    }

    fn flush_body(doc: &mut Document, section: NodeId, body: &mut Vec<&str>, settings: &IndentationSettings) {
        if body.is_empty() {
            return;
        }
        if let Some(holder) = doc.content_of(section) {
            let leaves = classify_lines(body.as_slice(), settings);
            build_tree(doc, holder, leaves);
        }
        body.clear();
    }

    /* ------------------------------ Public entry points ------------------------------ */

    /// Parse a whole document given as lines without terminators.
    pub fn parse_document<S: AsRef<str>>(lines: &[S], settings: &IndentationSettings) -> Document {
        let mut doc = Document::new();
        let mut stack = vec![doc.root()];
        let mut body: Vec<&str> = Vec::new();
        let mut sections = 0usize;

        for line in lines {
            let line = line.as_ref();
            let Some(depth) = heading_depth(line) else {
                body.push(line);
                continue;
            };
            let current = stack.last().copied().unwrap_or(doc.root());
            flush_body(&mut doc, current, &mut body, settings);

            while stack.len() > 1 && stack.last().is_some_and(|top| doc.level(*top) >= depth) {
                stack.pop();
            }
            let parent = stack.last().copied().unwrap_or(doc.root());
            let section = doc.new_section(line, depth);
            doc.append(parent, section);
            stack.push(section);
            sections += 1;
        }
        let current = stack.last().copied().unwrap_or(doc.root());
        flush_body(&mut doc, current, &mut body, settings);

        debug!(lines = lines.len(), sections, nodes = doc.node_count(), "parsed document");
        doc
    }

    /// Parse a document from text, splitting on `\n` only.
    pub fn parse_str(text: &str, settings: &IndentationSettings) -> Document {
        let lines: Vec<&str> = text.split('\n').collect();
        parse_document(&lines, settings)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn spaces() -> IndentationSettings {
            IndentationSettings::default()
        }

        fn texts(doc: &Document, ids: &[NodeId]) -> Vec<String> {
            ids.iter()
                .map(|id| doc.text(*id).unwrap_or_default().to_string())
                .collect()
        }

        #[test]
        fn classifies_list_items_with_space_indentation() {
            let s = spaces();
            assert_eq!(
                classify_line("- [ ] a", &s),
                FlatLeaf {
                    kind: LeafKind::ListItem,
                    text: "- [ ] a".into(),
                    level: 2
                }
            );
            assert_eq!(classify_line("    * b", &s).level, 4);
            assert_eq!(classify_line("  12. c", &s).level, 3);
            assert_eq!(classify_line("  12. c", &s).text, "12. c");
        }

        #[test]
        fn rounds_up_partial_space_units() {
            let s = IndentationSettings {
                use_tab: false,
                tab_size: 4,
            };
            assert_eq!(classify_line("  - a", &s).level, 3);
            assert_eq!(classify_line("    - a", &s).level, 3);
            assert_eq!(classify_line("      - a", &s).level, 4);
        }

        #[test]
        fn counts_tab_characters() {
            let s = IndentationSettings {
                use_tab: true,
                tab_size: 4,
            };
            assert_eq!(classify_line("\t\t- a", &s).level, 4);
            assert_eq!(classify_line("\tcontinued", &s).level, 3);
        }

        #[test]
        fn classifies_text_lines() {
            let s = spaces();
            let nested = classify_line("  more about a", &s);
            assert_eq!(nested.kind, LeafKind::Text);
            assert_eq!(nested.level, 3);
            assert_eq!(nested.text, "more about a");

            let top = classify_line("plain", &s);
            assert_eq!((top.kind, top.level), (LeafKind::Text, TOP_LEVEL));

            // A single space is not an indentation unit.
            assert_eq!(classify_line(" x", &s).level, TOP_LEVEL);
            // A marker without a following space is not a list item.
            assert_eq!(classify_line("-x", &s).kind, LeafKind::Text);
        }

        #[test]
        fn dash_after_indentation_backs_off_one_unit() {
            let s = spaces();
            let leaf = classify_line("    -x", &s);
            assert_eq!(leaf.kind, LeafKind::Text);
            assert_eq!(leaf.level, 3);
            assert_eq!(leaf.text, "  -x");

            assert_eq!(classify_line("  -x", &s).level, TOP_LEVEL);
        }

        #[test]
        fn recovers_list_nesting() {
            let doc = parse_document(&["- [ ] a", "  - [ ] b", "    - [ ] c"], &spaces());
            let content = doc.content_of(doc.root()).unwrap();

            let top = doc.children(content).to_vec();
            assert_eq!(texts(&doc, &top), vec!["- [ ] a"]);
            let b = doc.children(top[0]).to_vec();
            assert_eq!(texts(&doc, &b), vec!["- [ ] b"]);
            let c = doc.children(b[0]).to_vec();
            assert_eq!(texts(&doc, &c), vec!["- [ ] c"]);
        }

        #[test]
        fn steps_back_out_of_nested_lists() {
            let doc = parse_document(&["- a", "  - b", "    - c", "  - d", "- e"], &spaces());
            let content = doc.content_of(doc.root()).unwrap();

            let top = doc.children(content).to_vec();
            assert_eq!(texts(&doc, &top), vec!["- a", "- e"]);
            let under_a = doc.children(top[0]).to_vec();
            assert_eq!(texts(&doc, &under_a), vec!["- b", "- d"]);
        }

        #[test]
        fn indentation_jumps_do_not_escape_the_holder() {
            let doc = parse_document(&["- a", "      - b", "  - c", "- d"], &spaces());
            let content = doc.content_of(doc.root()).unwrap();

            let top = doc.children(content).to_vec();
            assert_eq!(texts(&doc, &top), vec!["- a", "- d"]);
            let under_a = doc.children(top[0]).to_vec();
            assert_eq!(texts(&doc, &under_a), vec!["- b", "- c"]);
        }

        #[test]
        fn text_lines_attach_to_the_current_item() {
            let doc = parse_document(&["- a", "  note", "", "  orphan"], &spaces());
            let content = doc.content_of(doc.root()).unwrap();

            let top = doc.children(content).to_vec();
            assert_eq!(texts(&doc, &top), vec!["- a", "", "orphan"]);
            assert_eq!(texts(&doc, doc.children(top[0])), vec!["note"]);
        }

        #[test]
        fn builds_section_tree_by_heading_depth() {
            let doc = parse_document(
                &["intro", "# One", "- a", "## Two", "- b", "### Three", "# Four", "- c"],
                &spaces(),
            );
            let root = doc.root();

            let top = doc.children(root).to_vec();
            assert_eq!(texts(&doc, &top), vec!["# One", "# Four"]);
            let two = doc.children(top[0]).to_vec();
            assert_eq!(texts(&doc, &two), vec!["## Two"]);
            assert_eq!(texts(&doc, doc.children(two[0])), vec!["### Three"]);

            let intro = doc.content_of(root).unwrap();
            assert_eq!(texts(&doc, doc.children(intro)), vec!["intro"]);
            let four = doc.content_of(top[1]).unwrap();
            assert_eq!(texts(&doc, doc.children(four)), vec!["- c"]);
        }

        #[test]
        fn lists_do_not_nest_across_headings() {
            let doc = parse_document(&["- a", "# H", "  - b"], &spaces());
            let heading = doc.children(doc.root())[0];
            let content = doc.content_of(heading).unwrap();
            assert_eq!(texts(&doc, doc.children(content)), vec!["- b"]);
        }

        #[test]
        fn heading_helpers() {
            assert_eq!(heading_depth("### Notes"), Some(3));
            assert_eq!(heading_depth("####### Too deep"), None);
            assert_eq!(heading_depth("#tag"), None);
            assert_eq!(heading_title("## Archived  "), Some("Archived"));
            assert!(is_heading_titled("## Archived tasks", "Archived"));
            assert!(!is_heading_titled("Archived", "Archived"));
        }

        #[test]
        fn task_status_reads_checkbox() {
            assert_eq!(task_status("- [x] done"), Some('x'));
            assert_eq!(task_status("1. [ ] open"), Some(' '));
            assert_eq!(task_status("* [>] moved"), Some('>'));
            assert_eq!(task_status("- plain"), None);
            assert_eq!(task_status("-  [x] two spaces"), None);
        }
    }
}

pub mod format {
    //! Serializer: the inverse of `parser`, recomputing indentation from levels.

    use crate::core::*;
    use crate::parser::{BASE_ITEM_LEVEL, TOP_LEVEL};
    use crate::settings::IndentationSettings;

    /// One indentation unit.
    pub fn build_indentation(settings: &IndentationSettings) -> String {
        if settings.use_tab {
            "\t".to_string()
        } else {
            " ".repeat(settings.tab_size)
        }
    }

    pub fn format_document(doc: &Document, settings: &IndentationSettings) -> Vec<String> {
        let indentation = build_indentation(settings);
        let mut out = Vec::new();
        emit(doc, doc.root(), &indentation, &mut out);
        out
    }

    pub fn format_document_text(doc: &Document, settings: &IndentationSettings) -> String {
        format_document(doc, settings).join("\n")
    }

    fn emit(doc: &Document, id: NodeId, indentation: &str, out: &mut Vec<String>) {
        match doc.kind(id) {
            NodeKind::Root { content } | NodeKind::Section { content } => {
                if let Some(heading) = doc.text(id) {
                    out.push(heading.to_string());
                }
                emit(doc, content, indentation, out);
            }
            NodeKind::Content => {}
            NodeKind::ListItem | NodeKind::Text => {
                let text = doc.text(id).unwrap_or_default();
                let level = doc.level(id);
                if matches!(doc.kind(id), NodeKind::Text) && level <= TOP_LEVEL {
                    out.push(text.to_string());
                } else {
                    let units = level.saturating_sub(BASE_ITEM_LEVEL);
                    out.push(format!("{}{}", indentation.repeat(units), text));
                }
            }
        }
        for child in doc.children(id) {
            emit(doc, *child, indentation, out);
        }
    }

}

pub mod projectors {
    pub mod task_extractor {
        //! Pull matching list items out of a section tree.

        use crate::core::*;
        use crate::parser::{heading_title, task_status};
        use tracing::debug;

        /// A detached list item plus the heading it was found under.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct ExtractedTask {
            pub node: NodeId,
            /// Closest heading above the item (markers stripped); `None` before the first heading.
            pub heading: Option<String>,
        }

        /// Whether `id` is a list item whose checkbox passes `accept`.
        pub fn is_task_with_status(doc: &Document, id: NodeId, accept: impl Fn(char) -> bool) -> bool {
            matches!(doc.kind(id), NodeKind::ListItem)
                && doc.text(id).and_then(task_status).is_some_and(accept)
        }

        /// Detach every list item matching `is_task` from the sections admitted by
        /// `admit_section`, in document order.
        ///
        /// A section rejected by `admit_section` is skipped with its whole subtree. Matching
        /// items nested under non-matching items are still taken; a taken item keeps its own
        /// children and is not searched further.
        pub fn extract_tasks<B, S>(doc: &mut Document, is_task: B, admit_section: S) -> Vec<ExtractedTask>
        where
            B: Fn(&Document, NodeId) -> bool,
            S: Fn(&Document, NodeId) -> bool,
        {
            let mut found = Vec::new();
            let mut sections = vec![doc.root()];
            let tree: &Document = doc;
            while let Some(section) = sections.pop() {
                if !admit_section(tree, section) {
                    continue;
                }
                let heading = tree.text(section).and_then(heading_title);
                if let Some(content) = tree.content_of(section) {
                    collect_matches(tree, content, &is_task, heading, &mut found);
                }
                for child in tree.children(section).iter().rev() {
                    sections.push(*child);
                }
            }

            for task in &found {
                doc.detach(task.node);
            }
            debug!(tasks = found.len(), "extracted tasks");
            found
        }

        fn collect_matches<B>(
            doc: &Document,
            holder: NodeId,
            is_task: &B,
            heading: Option<&str>,
            out: &mut Vec<ExtractedTask>,
        ) where
            B: Fn(&Document, NodeId) -> bool,
        {
            let mut stack: Vec<NodeId> = doc.children(holder).iter().rev().copied().collect();
            while let Some(id) = stack.pop() {
                if is_task(doc, id) {
                    out.push(ExtractedTask {
                        node: id,
                        heading: heading.map(str::to_string),
                    });
                    continue;
                }
                for child in doc.children(id).iter().rev() {
                    stack.push(*child);
                }
            }
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::format::format_document;
            use crate::parser::{is_heading_titled, parse_document};
            use crate::settings::IndentationSettings;

            fn completed(doc: &Document, id: NodeId) -> bool {
                is_task_with_status(doc, id, |c| c == 'x')
            }

            fn not_archive(doc: &Document, id: NodeId) -> bool {
                !doc.text(id).is_some_and(|t| is_heading_titled(t, "Archived"))
            }

            fn run(lines: &[&str]) -> (Document, Vec<ExtractedTask>) {
                let mut doc = parse_document(lines, &IndentationSettings::default());
                let tasks = extract_tasks(&mut doc, completed, not_archive);
                (doc, tasks)
            }

            fn task_texts(doc: &Document, tasks: &[ExtractedTask]) -> Vec<String> {
                tasks
                    .iter()
                    .map(|t| doc.text(t.node).unwrap_or_default().to_string())
                    .collect()
            }

            #[test]
            fn extracts_in_document_order_across_sections() {
                let (doc, tasks) = run(&[
                    "- [x] root task",
                    "# One",
                    "- [ ] open",
                    "- [x] one",
                    "## Two",
                    "- [x] two",
                    "# Three",
                    "- [x] three",
                ]);

                assert_eq!(
                    task_texts(&doc, &tasks),
                    vec!["- [x] root task", "- [x] one", "- [x] two", "- [x] three"]
                );
                assert_eq!(tasks[0].heading, None);
                assert_eq!(tasks[2].heading.as_deref(), Some("Two"));
                assert_eq!(
                    format_document(&doc, &IndentationSettings::default()),
                    vec!["# One", "- [ ] open", "## Two", "# Three"]
                );
            }

            #[test]
            fn skips_archive_section_subtree() {
                let (doc, tasks) = run(&[
                    "- [x] live",
                    "# Archived",
                    "- [x] already archived",
                    "## 2024-01-01",
                    "- [x] also archived",
                ]);

                assert_eq!(task_texts(&doc, &tasks), vec!["- [x] live"]);
                assert_eq!(
                    format_document(&doc, &IndentationSettings::default()),
                    vec!["# Archived", "- [x] already archived", "## 2024-01-01", "- [x] also archived"]
                );
            }

            #[test]
            fn nested_match_under_open_parent_is_taken_with_children() {
                let (doc, tasks) = run(&[
                    "- [ ] parent",
                    "  - [x] child",
                    "    - [ ] grandchild",
                    "    notes",
                    "  - [ ] sibling",
                ]);

                assert_eq!(task_texts(&doc, &tasks), vec!["- [x] child"]);
                let child = tasks[0].node;
                assert_eq!(doc.parent(child), None);
                assert_eq!(doc.children(child).len(), 1);
                assert_eq!(
                    format_document(&doc, &IndentationSettings::default()),
                    vec!["- [ ] parent", "  - [ ] sibling"]
                );
            }

            #[test]
            fn completed_parent_is_not_flattened() {
                let (doc, tasks) = run(&["- [x] parent", "  - [x] child"]);
                assert_eq!(task_texts(&doc, &tasks), vec!["- [x] parent"]);
                assert_eq!(doc.children(tasks[0].node).len(), 1);
            }

            #[test]
            fn only_lowercase_x_counts_by_default() {
                let (_, tasks) = run(&["- [X] upper", "- [-] cancelled", "- [ ] open", "text [x]"]);
                assert!(tasks.is_empty());
            }
        }
    }

    pub mod date_tree_merger {
        //! Find-or-create the archive hierarchy and file tasks under it.

        use crate::core::*;
        use crate::parser::{BASE_ITEM_LEVEL, is_heading_titled};
        use crate::placeholders::PlaceholderContext;
        use crate::settings::{MAX_HEADING_DEPTH, TaskSortOrder};
        use tracing::debug;

        /// One configured level of the archive hierarchy.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum ContainerTemplate {
            /// A heading one level deeper than the section it sits in, rendered as markers
            /// plus the resolved text.
            Heading {
                text: String,
                date_format: Option<String>,
            },
            /// A list item rendered as `- ` plus the resolved text.
            ListItem {
                text: String,
                date_format: Option<String>,
            },
        }

        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct MergeOptions {
            pub chain: Vec<ContainerTemplate>,
            pub order: TaskSortOrder,
            pub sort_alphabetically: bool,
        }

        /// The archive section: a root-level heading titled `title` if present, otherwise the
        /// first such heading anywhere, otherwise a new section appended to the root.
        ///
        /// With `add_newlines`, a blank line is added before a new heading when the document
        /// currently ends in a non-blank line.
        pub fn ensure_archive_section(doc: &mut Document, title: &str, depth: usize, add_newlines: bool) -> NodeId {
            if let Some(found) = find_archive_section(doc, title) {
                return found;
            }

            if add_newlines {
                pad_before_new_heading(doc);
            }
            let section = doc.new_section(format!("{} {title}", "#".repeat(depth)), depth);
            doc.append(doc.root(), section);
            debug!(title, depth, "created archive section");
            section
        }

        fn find_archive_section(doc: &Document, title: &str) -> Option<NodeId> {
            let root = doc.root();
            let titled = |id: &NodeId| {
                doc.is_section(*id) && doc.text(*id).is_some_and(|t| is_heading_titled(t, title))
            };
            doc.children(root)
                .iter()
                .copied()
                .find(titled)
                .or_else(|| doc.subtree(root).into_iter().find(titled))
        }

        fn pad_before_new_heading(doc: &mut Document) {
            let Some(last) = doc.last_line(doc.root()) else {
                return;
            };
            if doc.text(last).is_some_and(|t| t.trim().is_empty()) {
                return;
            }
            let mut owner = doc.root();
            while let Some(next) = doc.children(owner).last().copied() {
                owner = next;
            }
            if let Some(content) = doc.content_of(owner) {
                let blank = doc.new_text("", crate::parser::TOP_LEVEL);
                doc.append(content, blank);
            }
        }

        /// Level a list item takes when appended under `container`.
        fn child_item_level(doc: &Document, container: NodeId) -> usize {
            match doc.kind(container) {
                NodeKind::ListItem => doc.level(container) + 1,
                _ => BASE_ITEM_LEVEL,
            }
        }

        fn resolve_heading(doc: &mut Document, section: NodeId, heading: String, depth: usize) -> NodeId {
            if let Some(found) = doc
                .children(section)
                .iter()
                .copied()
                .find(|id| doc.text(*id) == Some(heading.as_str()))
            {
                debug!(heading, "reusing heading container");
                return found;
            }
            let created = doc.new_section(heading, depth);
            doc.append(section, created);
            created
        }

        fn resolve_list_item(doc: &mut Document, position: NodeId, item: String) -> NodeId {
            let parent = doc.content_of(position).unwrap_or(position);
            if let Some(found) = doc.children(parent).iter().copied().find(|id| {
                matches!(doc.kind(*id), NodeKind::ListItem) && doc.text(*id) == Some(item.as_str())
            }) {
                debug!(item, "reusing list container");
                return found;
            }
            let level = child_item_level(doc, parent);
            let created = doc.new_list_item(item, level);
            doc.append(parent, created);
            created
        }

        /// Walk (creating as needed) the container chain below `archive_section` and append
        /// `tasks` to the last container. Returns the node the tasks were appended to.
        ///
        /// Every template is resolved against the same `ctx`, so one call files everything
        /// under one date key.
        pub fn merge_tasks(
            doc: &mut Document,
            archive_section: NodeId,
            mut tasks: Vec<NodeId>,
            options: &MergeOptions,
            ctx: &PlaceholderContext,
        ) -> Result<NodeId> {
            let mut position = archive_section;
            for template in &options.chain {
                position = match template {
                    ContainerTemplate::Heading { text, date_format } => {
                        let resolved = ctx.resolve(text, date_format.as_deref())?;
                        if !doc.is_section(position) {
                            return Err(ArchiveError::HeadingUnderListItem(resolved));
                        }
                        let depth = doc.level(position) + 1;
                        if depth > MAX_HEADING_DEPTH {
                            return Err(ArchiveError::HeadingTooDeep {
                                heading: resolved,
                                depth,
                            });
                        }
                        let heading = format!("{} {resolved}", "#".repeat(depth));
                        resolve_heading(doc, position, heading, depth)
                    }
                    ContainerTemplate::ListItem { text, date_format } => {
                        let resolved = ctx.resolve(text, date_format.as_deref())?;
                        resolve_list_item(doc, position, format!("- {resolved}"))
                    }
                };
            }

            let target = doc.content_of(position).unwrap_or(position);
            if options.sort_alphabetically {
                tasks.sort_by(|a, b| doc.text(*a).cmp(&doc.text(*b)));
            }
            if options.order == TaskSortOrder::NewestFirst {
                tasks.reverse();
            }
            let level = child_item_level(doc, target);
            for task in &tasks {
                doc.relevel(*task, level);
                doc.append(target, *task);
            }
            debug!(tasks = tasks.len(), "merged tasks into archive");
            Ok(target)
        }

    }
}

pub mod storage {
    //! Where documents come from and go to. Everything else in the crate works on
    //! in-memory `Document`s only.

    use crate::core::{ArchiveError, Result};
    use std::fs;
    use std::io::ErrorKind;
    use std::path::{Path, PathBuf};
    use tracing::debug;

    pub const DOCUMENT_EXTENSION: &str = "md";

    /// A Markdown document, addressed relative to the vault root.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DocumentRef {
        pub path: PathBuf,
    }

    impl DocumentRef {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// File name without extension.
        pub fn basename(&self) -> String {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        }

        pub fn is_markdown(&self) -> bool {
            has_markdown_extension(&self.path)
        }

        pub fn display_path(&self) -> String {
            self.path.display().to_string()
        }
    }

    pub fn has_markdown_extension(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == DOCUMENT_EXTENSION)
    }

    /// What a path resolves to.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Located {
        Document(DocumentRef),
        /// Something that exists but is not a Markdown document (a folder, another file type).
        Other(PathBuf),
    }

    pub trait Vault {
        /// The document the user is working in.
        fn active_document(&self) -> Option<DocumentRef>;

        /// Resolve `path`; `None` when nothing exists there.
        fn locate(&self, path: &Path) -> Result<Option<Located>>;

        /// Read a document as lines without terminators. Fails for non-Markdown documents.
        fn read(&self, doc: &DocumentRef) -> Result<Vec<String>>;

        fn write(&self, doc: &DocumentRef, lines: &[String]) -> Result<()>;

        /// Create an empty document.
        fn create(&self, path: &Path) -> Result<DocumentRef>;
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
        move |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// A directory of Markdown files on disk.
    #[derive(Debug, Clone)]
    pub struct FsVault {
        root: PathBuf,
        active: Option<PathBuf>,
    }

    impl FsVault {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                active: None,
            }
        }

        /// Mark `path` (relative to the root) as the active document.
        pub fn with_active(mut self, path: impl Into<PathBuf>) -> Self {
            self.active = Some(path.into());
            self
        }

        fn abs_path(&self, rel: &Path) -> PathBuf {
            self.root.join(rel)
        }
    }

    impl Vault for FsVault {
        fn active_document(&self) -> Option<DocumentRef> {
            self.active.clone().map(DocumentRef::new)
        }

        fn locate(&self, path: &Path) -> Result<Option<Located>> {
            let abs = self.abs_path(path);
            match fs::metadata(&abs) {
                Ok(meta) if meta.is_file() && has_markdown_extension(path) => {
                    Ok(Some(Located::Document(DocumentRef::new(path))))
                }
                Ok(_) => Ok(Some(Located::Other(path.to_path_buf()))),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(io_error(&abs)(err)),
            }
        }

        fn read(&self, doc: &DocumentRef) -> Result<Vec<String>> {
            if !doc.is_markdown() {
                return Err(ArchiveError::UnsupportedDocument(doc.path.clone()));
            }
            let abs = self.abs_path(&doc.path);
            let text = fs::read_to_string(&abs).map_err(io_error(&abs))?;
            debug!(path = ?abs, bytes = text.len(), "read document");
            if text.is_empty() {
                return Ok(vec![]);
            }
            Ok(text.split('\n').map(str::to_string).collect())
        }

        fn write(&self, doc: &DocumentRef, lines: &[String]) -> Result<()> {
            let abs = self.abs_path(&doc.path);
            fs::write(&abs, lines.join("\n")).map_err(io_error(&abs))?;
            debug!(path = ?abs, lines = lines.len(), "wrote document");
            Ok(())
        }

        fn create(&self, path: &Path) -> Result<DocumentRef> {
            let abs = self.abs_path(path);
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            fs::write(&abs, "").map_err(io_error(&abs))?;
            debug!(path = ?abs, "created document");
            Ok(DocumentRef::new(path))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn locate_distinguishes_documents_from_other_entries() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(tmp.path().join("notes.md"), "- a").expect("write notes");
            fs::write(tmp.path().join("notes.txt"), "- a").expect("write txt");
            fs::create_dir_all(tmp.path().join("folder.md")).expect("mkdir");
            let vault = FsVault::new(tmp.path());

            assert_eq!(
                vault.locate(Path::new("notes.md")).unwrap(),
                Some(Located::Document(DocumentRef::new("notes.md")))
            );
            assert!(matches!(
                vault.locate(Path::new("notes.txt")).unwrap(),
                Some(Located::Other(_))
            ));
            assert!(matches!(
                vault.locate(Path::new("folder.md")).unwrap(),
                Some(Located::Other(_))
            ));
            assert_eq!(vault.locate(Path::new("missing.md")).unwrap(), None);
        }

        #[test]
        fn read_write_create_round_trip() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let vault = FsVault::new(tmp.path());

            let doc = vault.create(Path::new("sub/new.md")).expect("create");
            assert_eq!(vault.read(&doc).unwrap(), Vec::<String>::new());

            let lines = vec!["# Title".to_string(), "- a".to_string(), String::new()];
            vault.write(&doc, &lines).expect("write");
            assert_eq!(
                fs::read_to_string(tmp.path().join("sub/new.md")).unwrap(),
                "# Title\n- a\n"
            );
            assert_eq!(vault.read(&doc).unwrap(), lines);
        }

        #[test]
        fn read_rejects_other_document_kinds() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(tmp.path().join("notes.txt"), "- [x] a").expect("write");
            let vault = FsVault::new(tmp.path());

            let err = vault.read(&DocumentRef::new("notes.txt")).unwrap_err();
            assert!(matches!(err, ArchiveError::UnsupportedDocument(_)));
        }

        #[test]
        fn basename_strips_extension_and_folders() {
            let doc = DocumentRef::new("journal/Inbox.md");
            assert_eq!(doc.basename(), "Inbox");
        }
    }
}

pub mod archiver {
    //! The user-facing operation: archive completed tasks of the active document.
    //!
    //! Sequencing: read and parse the source, extract, then read/parse each destination,
    //! merge, and only then write destinations followed by the source. Any failure before
    //! the write phase leaves every document untouched.

    use crate::core::*;
    use crate::format::format_document;
    use crate::parser::{is_heading_titled, parse_document, task_status};
    use crate::placeholders::PlaceholderContext;
    use crate::projectors::date_tree_merger::{MergeOptions, ensure_archive_section, merge_tasks};
    use crate::projectors::task_extractor::{ExtractedTask, extract_tasks, is_task_with_status};
    use crate::settings::ArchiverSettings;
    use crate::storage::{DOCUMENT_EXTENSION, DocumentRef, Located, Vault, has_markdown_extension};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use regex::Regex;
    use std::path::{Path, PathBuf};
    use tracing::{debug, info};

    pub const NOTHING_TO_ARCHIVE: &str = "No tasks to archive";

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Destination {
        Active,
        File(PathBuf),
    }

    /// A destination plus the date format its templates resolve with.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Route {
        destination: Destination,
        date_format: String,
    }

    enum Target {
        Source,
        Existing(DocumentRef),
        Missing(PathBuf),
    }

    pub struct Archiver<V> {
        vault: V,
        settings: ArchiverSettings,
        replacement: Option<Regex>,
        today: NaiveDate,
    }

    impl<V: Vault> Archiver<V> {
        /// Validate `settings` and bind the run date used by every placeholder.
        pub fn new(vault: V, settings: ArchiverSettings, today: NaiveDate) -> Result<Self> {
            settings.validate()?;
            let replacement = if settings.text_replacement.apply_replacement {
                Some(Regex::new(&settings.text_replacement.regex)?)
            } else {
                None
            };
            Ok(Self {
                vault,
                settings,
                replacement,
                today,
            })
        }

        /// Move completed tasks of the active document into its archive(s) and report
        /// how many were moved.
        pub fn archive_tasks_in_active_file(&self) -> Result<String> {
            let active = self
                .vault
                .active_document()
                .ok_or(ArchiveError::NoActiveDocument)?;
            let mut source = self.parse(&active)?;
            let ctx = PlaceholderContext::new(self.today, self.settings.date_format.clone())
                .with_source(active.basename(), active.display_path());

            let tasks = self.extract(&mut source);
            if tasks.is_empty() {
                info!(path = %active.display_path(), "no tasks to archive");
                return Ok(NOTHING_TO_ARCHIVE.to_string());
            }
            let count = tasks.len();

            let mut routes: IndexMap<Route, Vec<NodeId>> = IndexMap::new();
            for task in &tasks {
                let route = self.route_for(&source, task.node, &active, &ctx)?;
                self.prepare(&mut source, task, &ctx)?;
                routes.entry(route).or_default().push(task.node);
            }

            // Resolve every destination before touching storage.
            let mut planned = Vec::with_capacity(routes.len());
            for (route, nodes) in routes {
                let target = match &route.destination {
                    Destination::Active => Target::Source,
                    Destination::File(path) => self.locate_archive(path)?,
                };
                planned.push((route.date_format, nodes, target));
            }

            // Missing archives start as empty documents and are only created once every
            // read and merge has succeeded.
            let mut pending: Vec<(DocumentRef, Document)> = Vec::new();
            let mut missing: Vec<DocumentRef> = Vec::new();
            for (date_format, nodes, target) in planned {
                let ctx = ctx.with_date_format(&date_format);
                let (target, exists) = match target {
                    Target::Source => (active.clone(), true),
                    Target::Existing(doc) => (doc, true),
                    Target::Missing(path) => (DocumentRef::new(path), false),
                };
                if target == active {
                    self.archive_into(&mut source, nodes, &ctx)?;
                    continue;
                }
                let slot = match pending.iter().position(|(r, _)| *r == target) {
                    Some(slot) => slot,
                    None => {
                        let parsed = if exists {
                            self.parse(&target)?
                        } else {
                            missing.push(target.clone());
                            Document::new()
                        };
                        pending.push((target, parsed));
                        pending.len() - 1
                    }
                };
                let doc = &mut pending[slot].1;
                let moved = nodes.iter().map(|n| doc.transplant(&source, *n)).collect();
                self.archive_into(doc, moved, &ctx)?;
            }

            for (target, doc) in &pending {
                if missing.contains(target) {
                    self.vault.create(&target.path)?;
                }
                self.write(target, doc)?;
            }
            self.write(&active, &source)?;

            info!(path = %active.display_path(), count, "archived tasks");
            Ok(format!("Archived {count} tasks"))
        }

        fn parse(&self, target: &DocumentRef) -> Result<Document> {
            let lines = self.vault.read(target)?;
            Ok(parse_document(&lines, &self.settings.indentation_settings))
        }

        fn write(&self, target: &DocumentRef, doc: &Document) -> Result<()> {
            let lines = format_document(doc, &self.settings.indentation_settings);
            self.vault.write(target, &lines)
        }

        fn extract(&self, doc: &mut Document) -> Vec<ExtractedTask> {
            let settings = &self.settings;
            extract_tasks(
                doc,
                |doc, id| is_task_with_status(doc, id, |status| settings.is_archivable_status(status)),
                |doc, id| {
                    !doc
                        .text(id)
                        .is_some_and(|t| is_heading_titled(t, &settings.archive_heading))
                },
            )
        }

        /// Apply the text replacement to the task and its nested items, then append metadata.
        fn prepare(&self, doc: &mut Document, task: &ExtractedTask, ctx: &PlaceholderContext) -> Result<()> {
            if let Some(pattern) = &self.replacement {
                let replacement = self.settings.text_replacement.replacement.as_str();
                for id in doc.subtree(task.node) {
                    if !matches!(doc.kind(id), NodeKind::ListItem) {
                        continue;
                    }
                    let Some(replaced) = doc
                        .text(id)
                        .map(|t| pattern.replace(t, replacement).into_owned())
                    else {
                        continue;
                    };
                    doc.set_text(id, replaced);
                }
            }

            let metadata = &self.settings.additional_metadata_before_archiving;
            if metadata.add_metadata {
                let resolved = ctx
                    .with_heading(task.heading.as_deref())
                    .resolve(&metadata.metadata, metadata.date_format.as_deref())?;
                if !resolved.is_empty() {
                    let text = format!("{} {resolved}", doc.text(task.node).unwrap_or_default());
                    doc.set_text(task.node, text);
                }
            }
            Ok(())
        }

        fn route_for(
            &self,
            doc: &Document,
            task: NodeId,
            active: &DocumentRef,
            ctx: &PlaceholderContext,
        ) -> Result<Route> {
            let rule = doc
                .text(task)
                .and_then(task_status)
                .and_then(|status| self.settings.rule_for_status(status));
            let (separate, template, date_format) = match rule {
                Some(rule) => (
                    rule.archive_to_separate_file,
                    rule.default_archive_file_name.as_str(),
                    rule.date_format.as_str(),
                ),
                None => (
                    self.settings.archive_to_separate_file,
                    self.settings.default_archive_file_name.as_str(),
                    self.settings.date_format.as_str(),
                ),
            };
            let template = if template.trim().is_empty() {
                self.settings.default_archive_file_name.as_str()
            } else {
                template
            };
            let destination = if separate {
                let ctx = ctx.with_date_format(date_format);
                Destination::File(archive_file_path(template, active, &ctx)?)
            } else {
                Destination::Active
            };
            debug!(?destination, "routed task");
            Ok(Route {
                destination,
                date_format: date_format.to_string(),
            })
        }

        fn locate_archive(&self, path: &Path) -> Result<Target> {
            match self.vault.locate(path)? {
                Some(Located::Document(doc)) => Ok(Target::Existing(doc)),
                Some(Located::Other(other)) => Err(ArchiveError::TargetConflict(other)),
                None => Ok(Target::Missing(path.to_path_buf())),
            }
        }

        fn archive_into(&self, doc: &mut Document, tasks: Vec<NodeId>, ctx: &PlaceholderContext) -> Result<()> {
            let section = ensure_archive_section(
                doc,
                &self.settings.archive_heading,
                self.settings.archive_heading_depth,
                self.settings.add_newlines_around_headings,
            );
            let options = MergeOptions {
                chain: self.settings.container_chain(),
                order: self.settings.task_sort_order,
                sort_alphabetically: self.settings.sort_alphabetically,
            };
            merge_tasks(doc, section, tasks, &options, ctx)?;
            Ok(())
        }
    }

    /// Resolve an archive file name template: `%` is the active document's base name,
    /// placeholders are substituted and `.md` is added when missing.
    pub fn archive_file_path(template: &str, active: &DocumentRef, ctx: &PlaceholderContext) -> Result<PathBuf> {
        let name = ctx.resolve(&template.replace('%', &active.basename()), None)?;
        let path = PathBuf::from(&name);
        if has_markdown_extension(&path) {
            Ok(path)
        } else {
            Ok(PathBuf::from(format!("{name}.{DOCUMENT_EXTENSION}")))
        }
    }

}

pub use archiver::Archiver;
pub use format::format_document;
pub use parser::{parse_document, parse_str};
