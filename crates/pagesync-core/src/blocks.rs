use crate::buffer::MarkId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Language sent for code blocks that never had one.
pub const DEFAULT_CODE_LANGUAGE: &str = "plain text";
pub const DEFAULT_COLOR: &str = "default";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    #[default]
    Paragraph,
    Heading { level: u8, toggleable: bool },
    Quote,
    BulletedListItem,
    NumberedListItem,
    ToDo { checked: bool },
    Code { language: Option<String> },
    Divider,
    Toggle,
    Callout { icon: Option<String> },
    Unsupported { type_name: String },
}

impl BlockKind {
    pub fn heading(level: u8) -> Self {
        BlockKind::Heading {
            level: level.clamp(1, 3),
            toggleable: false,
        }
    }

    /// Remote type name, also used as the key of the type payload on the wire.
    pub fn type_name(&self) -> &str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading { level, .. } => match level {
                0 | 1 => "heading_1",
                2 => "heading_2",
                _ => "heading_3",
            },
            BlockKind::Quote => "quote",
            BlockKind::BulletedListItem => "bulleted_list_item",
            BlockKind::NumberedListItem => "numbered_list_item",
            BlockKind::ToDo { .. } => "to_do",
            BlockKind::Code { .. } => "code",
            BlockKind::Divider => "divider",
            BlockKind::Toggle => "toggle",
            BlockKind::Callout { .. } => "callout",
            BlockKind::Unsupported { type_name } => type_name.as_str(),
        }
    }

    pub fn is_editable(&self) -> bool {
        !matches!(self, BlockKind::Divider | BlockKind::Unsupported { .. })
    }

    pub fn has_rich_text(&self) -> bool {
        !matches!(self, BlockKind::Divider | BlockKind::Unsupported { .. })
    }

    fn toggleable(&self) -> bool {
        matches!(
            self,
            BlockKind::Heading {
                toggleable: true,
                ..
            }
        )
    }

    /// True when both kinds map to the same remote type. Checked state, language
    /// and icon are cosmetic and can be changed with an in-place update.
    pub fn same_semantic_type(&self, other: &BlockKind) -> bool {
        self.type_name() == other.type_name() && self.toggleable() == other.toggleable()
    }

    /// Carries over fields a line rendering cannot express.
    pub fn inherit_hidden(&mut self, original: &BlockKind) {
        if let (BlockKind::Callout { icon }, BlockKind::Callout { icon: previous }) =
            (&mut *self, original)
        {
            if icon.is_none() {
                *icon = previous.clone();
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Annotations {
    pub bold: bool,
    pub italic: bool,
    pub strikethrough: bool,
    pub underline: bool,
    pub code: bool,
    pub color: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    #[serde(default)]
    pub annotations: Annotations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl TextRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

pub fn plain_text(runs: &[TextRun]) -> String {
    runs.iter().map(|run| run.text.as_str()).collect()
}

/// Identity of a block as seen by the planner: the remote id once known,
/// otherwise the local placeholder.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockRef {
    Remote(String),
    Temp(String),
}

impl BlockRef {
    pub fn as_str(&self) -> &str {
        match self {
            BlockRef::Remote(id) | BlockRef::Temp(id) => id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentRef {
    Workspace,
    Page { id: String },
    Database { id: String },
    Block { id: String },
}

impl ParentRef {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParentRef::Workspace => "workspace",
            ParentRef::Page { .. } => "page",
            ParentRef::Database { .. } => "database",
            ParentRef::Block { .. } => "block",
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            ParentRef::Workspace => None,
            ParentRef::Page { id } | ParentRef::Database { id } | ParentRef::Block { id } => {
                Some(id)
            }
        }
    }

    pub fn from_parts(type_name: &str, id: Option<String>) -> Self {
        match (type_name, id) {
            ("page", Some(id)) => ParentRef::Page { id },
            ("database", Some(id)) => ParentRef::Database { id },
            ("block", Some(id)) => ParentRef::Block { id },
            _ => ParentRef::Workspace,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    pub id: Option<String>,
    pub title: String,
    pub icon: Option<String>,
    pub parent: ParentRef,
    pub content_hash: Option<String>,
    pub last_synced_at: Option<i64>,
}

impl Page {
    pub fn new(id: Option<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            icon: None,
            parent: ParentRef::Workspace,
            content_hash: None,
            last_synced_at: None,
        }
    }
}

/// A block as the remote store holds it. Snapshots and cache rows are made of these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedBlock {
    pub id: String,
    #[serde(flatten)]
    pub kind: BlockKind,
    #[serde(default)]
    pub content: Vec<TextRun>,
}

impl SyncedBlock {
    pub fn new(id: impl Into<String>, kind: BlockKind, content: Vec<TextRun>) -> Self {
        Self {
            id: id.into(),
            kind,
            content,
        }
    }

    pub fn serialize(&self) -> Value {
        wire_block(Some(&self.id), &self.kind, &self.content)
    }

    pub fn content_hash(&self) -> String {
        hash_values(std::iter::once(self.serialize()))
    }

    /// Parses a block object returned by the remote API. Types this engine does not
    /// model come back as `Unsupported` so they stay in the buffer read-only.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let id = value.get("id")?.as_str()?.to_string();
        let type_name = value.get("type")?.as_str()?;
        let payload = value.get(type_name).cloned().unwrap_or(Value::Null);
        let kind = match type_name {
            "paragraph" => BlockKind::Paragraph,
            "heading_1" | "heading_2" | "heading_3" => BlockKind::Heading {
                level: type_name[8..].parse().unwrap_or(1),
                toggleable: payload
                    .get("is_toggleable")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "quote" => BlockKind::Quote,
            "bulleted_list_item" => BlockKind::BulletedListItem,
            "numbered_list_item" => BlockKind::NumberedListItem,
            "to_do" => BlockKind::ToDo {
                checked: payload
                    .get("checked")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "code" => BlockKind::Code {
                language: payload
                    .get("language")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "divider" => BlockKind::Divider,
            "toggle" => BlockKind::Toggle,
            "callout" => BlockKind::Callout {
                icon: payload
                    .get("icon")
                    .and_then(|icon| icon.get("emoji"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            other => BlockKind::Unsupported {
                type_name: other.to_string(),
            },
        };
        let content = if kind.has_rich_text() {
            payload
                .get("rich_text")
                .and_then(Value::as_array)
                .map(|runs| runs.iter().map(run_from_wire).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Some(Self { id, kind, content })
    }
}

/// Hash over the serialized form of a block sequence, in order.
pub fn content_hash(blocks: &[SyncedBlock]) -> String {
    hash_values(blocks.iter().map(SyncedBlock::serialize))
}

fn hash_values(values: impl Iterator<Item = Value>) -> String {
    let mut hasher = Sha256::new();
    for value in values {
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Clone, Debug, PartialEq)]
struct Original {
    kind: BlockKind,
    content: Vec<TextRun>,
    lines: Vec<String>,
}

/// One unit of buffer content. Exactly one of `id` / `temp_id` is set at any time.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    id: Option<String>,
    temp_id: Option<String>,
    pub kind: BlockKind,
    pub content: Vec<TextRun>,
    pub mark: Option<MarkId>,
    pub anchor: Option<BlockRef>,
    dirty: bool,
    original: Option<Original>,
}

impl Block {
    pub fn new_local(kind: BlockKind, content: Vec<TextRun>) -> Self {
        Self {
            id: None,
            temp_id: Some(new_temp_id()),
            kind,
            content,
            mark: None,
            anchor: None,
            dirty: true,
            original: None,
        }
    }

    pub fn from_synced(block: &SyncedBlock, lines: Vec<String>) -> Self {
        Self {
            id: Some(block.id.clone()),
            temp_id: None,
            kind: block.kind.clone(),
            content: block.content.clone(),
            mark: None,
            anchor: None,
            dirty: false,
            original: Some(Original {
                kind: block.kind.clone(),
                content: block.content.clone(),
                lines,
            }),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn temp_id(&self) -> Option<&str> {
        self.temp_id.as_deref()
    }

    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    pub fn block_ref(&self) -> BlockRef {
        match (&self.id, &self.temp_id) {
            (Some(id), _) => BlockRef::Remote(id.clone()),
            (None, Some(temp_id)) => BlockRef::Temp(temp_id.clone()),
            (None, None) => BlockRef::Temp(String::new()),
        }
    }

    /// Records the identity assigned by the remote store.
    pub fn resolve_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
        self.temp_id = None;
    }

    /// Drops the remote identity after the remote copy is gone, turning the block
    /// back into a pending create. Returns the fresh placeholder.
    pub fn detach_remote(&mut self) -> String {
        let temp_id = new_temp_id();
        self.id = None;
        self.temp_id = Some(temp_id.clone());
        self.original = None;
        self.dirty = true;
        temp_id
    }

    pub fn editable(&self) -> bool {
        match &self.original {
            Some(original) => original.kind.is_editable(),
            None => self.kind.is_editable(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn original_lines(&self) -> Option<&[String]> {
        self.original.as_ref().map(|original| original.lines.as_slice())
    }

    pub fn original_kind(&self) -> Option<&BlockKind> {
        self.original.as_ref().map(|original| &original.kind)
    }

    pub fn original_content(&self) -> Option<&[TextRun]> {
        self.original
            .as_ref()
            .map(|original| original.content.as_slice())
    }

    /// Whether `lines` still equal the rendering recorded at the last sync.
    pub fn matches_content(&self, lines: &[String]) -> bool {
        self.original
            .as_ref()
            .is_some_and(|original| original.lines == lines)
    }

    /// Puts back the synced kind and content. Returns false for blocks never synced.
    pub fn restore_original(&mut self) -> bool {
        let Some(original) = &self.original else {
            return false;
        };
        self.kind = original.kind.clone();
        self.content = original.content.clone();
        self.dirty = false;
        true
    }

    pub fn type_changed(&self) -> bool {
        self.original
            .as_ref()
            .is_some_and(|original| !original.kind.same_semantic_type(&self.kind))
    }

    pub fn content_changed(&self) -> bool {
        match &self.original {
            Some(original) => original.kind != self.kind || original.content != self.content,
            None => true,
        }
    }

    /// Records `kind`/`content` as what the remote store now holds. The block stays
    /// dirty if the buffer moved on while the push was in flight.
    pub fn mark_synced(&mut self, kind: BlockKind, content: Vec<TextRun>, lines: Vec<String>) {
        self.original = Some(Original {
            kind,
            content,
            lines,
        });
        self.dirty = self.content_changed();
    }

    pub fn to_synced(&self) -> Option<SyncedBlock> {
        self.id
            .as_ref()
            .map(|id| SyncedBlock::new(id.clone(), self.kind.clone(), self.content.clone()))
    }

    /// Remote wire shape; new blocks carry no `id`.
    pub fn serialize(&self) -> Value {
        wire_block(self.id.as_deref(), &self.kind, &self.content)
    }
}

pub fn new_temp_id() -> String {
    format!("tmp-{}", Uuid::new_v4())
}

pub fn wire_block(id: Option<&str>, kind: &BlockKind, content: &[TextRun]) -> Value {
    let mut object = Map::new();
    object.insert("object".to_string(), json!("block"));
    if let Some(id) = id {
        object.insert("id".to_string(), json!(id));
    }
    let type_name = kind.type_name().to_string();
    object.insert("type".to_string(), json!(type_name));
    object.insert(type_name, type_payload(kind, content));
    Value::Object(object)
}

fn type_payload(kind: &BlockKind, content: &[TextRun]) -> Value {
    let mut payload = Map::new();
    if kind.has_rich_text() {
        payload.insert(
            "rich_text".to_string(),
            Value::Array(content.iter().map(run_to_wire).collect()),
        );
    }
    match kind {
        BlockKind::Heading { toggleable, .. } => {
            payload.insert("is_toggleable".to_string(), json!(toggleable));
        }
        BlockKind::ToDo { checked } => {
            payload.insert("checked".to_string(), json!(checked));
        }
        BlockKind::Code { language } => {
            let language = language
                .as_deref()
                .filter(|language| !language.trim().is_empty())
                .unwrap_or(DEFAULT_CODE_LANGUAGE);
            payload.insert("language".to_string(), json!(language));
        }
        BlockKind::Callout { icon: Some(icon) } => {
            payload.insert(
                "icon".to_string(),
                json!({ "type": "emoji", "emoji": icon }),
            );
        }
        BlockKind::Paragraph
        | BlockKind::Quote
        | BlockKind::BulletedListItem
        | BlockKind::NumberedListItem
        | BlockKind::Divider
        | BlockKind::Toggle
        | BlockKind::Callout { icon: None }
        | BlockKind::Unsupported { .. } => {}
    }
    Value::Object(payload)
}

fn run_to_wire(run: &TextRun) -> Value {
    let annotations = &run.annotations;
    json!({
        "type": "text",
        "text": {
            "content": run.text,
            "link": run.link.as_ref().map(|url| json!({ "url": url })),
        },
        "annotations": {
            "bold": annotations.bold,
            "italic": annotations.italic,
            "strikethrough": annotations.strikethrough,
            "underline": annotations.underline,
            "code": annotations.code,
            "color": annotations.color.as_deref().unwrap_or(DEFAULT_COLOR),
        },
    })
}

fn run_from_wire(value: &Value) -> TextRun {
    let text = value
        .get("plain_text")
        .or_else(|| value.pointer("/text/content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let link = value
        .pointer("/text/link/url")
        .or_else(|| value.get("href"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let mut annotations: Annotations = value
        .get("annotations")
        .cloned()
        .and_then(|raw| serde_json::from_value(raw).ok())
        .unwrap_or_default();
    if annotations.color.as_deref() == Some(DEFAULT_COLOR) {
        annotations.color = None;
    }
    TextRun {
        text,
        annotations,
        link,
    }
}
