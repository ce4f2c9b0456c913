//! Reference-library seam.
//!
//! [`LibraryClient`] is the boundary the publisher talks to. [`ZoteroClient`]
//! speaks the Zotero Web API v3; [`NullLibrary`] stands in when no library is
//! configured and turns every upload into a no-op.
//!
//! Collection lookup goes through [`CollectionRegistry`], which creates each
//! missing collection at most once per run even when several papers of the
//! same category publish at the same moment.

use crate::config::LibraryConfig;
use crate::error::{retry_after_secs, DigestError, StageError};
use crate::paper::Paper;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

macro_rules! key_type {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

key_type!(CollectionKey);
key_type!(ItemKey);
key_type!(NoteKey);

/// Bibliographic record uploaded for one paper.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryItem {
    pub id: String,
    pub title: String,
    pub abstract_text: String,
    pub url: String,
    pub authors: Vec<String>,
    pub date: Option<String>,
    pub tags: Vec<String>,
    /// Local PDF to link as an attachment.
    pub pdf_path: Option<PathBuf>,
}

impl LibraryItem {
    pub fn from_paper(paper: &Paper, tags: Vec<String>) -> Self {
        Self {
            id: paper.id().to_string(),
            title: paper.title().to_string(),
            abstract_text: paper.meta.abstract_text.clone(),
            url: paper.meta.abs_url(),
            authors: paper.meta.authors.clone(),
            date: paper.meta.published.map(|d| d.format("%Y-%m-%d").to_string()),
            tags,
            pdf_path: paper.artifacts.pdf_path.clone(),
        }
    }
}

#[async_trait]
pub trait LibraryClient: Send + Sync {
    fn name(&self) -> &str;

    /// False for clients that drop every write.
    fn enabled(&self) -> bool {
        true
    }

    async fn list_collections(&self) -> Result<Vec<(String, CollectionKey)>, StageError>;

    async fn create_collection(&self, name: &str, parent: Option<&CollectionKey>) -> Result<CollectionKey, StageError>;

    /// Create the item in `collection`.
    async fn upload_item(&self, item: &LibraryItem, collection: Option<&CollectionKey>) -> Result<ItemKey, StageError>;

    /// Attach the local PDF at `pdf` to `item` as a linked file.
    async fn link_pdf(&self, _item: &ItemKey, _pdf: &Path) -> Result<(), StageError> {
        Ok(())
    }

    async fn attach_note(&self, item: &ItemKey, html: &str) -> Result<NoteKey, StageError>;

    async fn update_note(&self, note: &NoteKey, html: &str) -> Result<(), StageError>;

    async fn create_standalone_note(&self, html: &str, collection: Option<&CollectionKey>) -> Result<NoteKey, StageError>;
}

/// Markdown note → the HTML shape library notes are stored in.
pub fn note_html(title: &str, markdown: &str) -> String {
    format!("<h1>{}</h1><hr>{}", escape_html(title), escape_html(markdown).replace('\n', "<br>"))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

// ── Collection registry ──────────────────────────────────────────────────

type Slot = Arc<tokio::sync::Mutex<Option<CollectionKey>>>;

/// Name → collection key cache with per-name creation locks.
pub struct CollectionRegistry {
    client: Arc<dyn LibraryClient>,
    parent: Option<CollectionKey>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl CollectionRegistry {
    pub fn new(client: Arc<dyn LibraryClient>, parent: Option<CollectionKey>) -> Self {
        Self {
            client,
            parent,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Record collections that already exist in the library.
    pub fn seed(&self, existing: impl IntoIterator<Item = (String, CollectionKey)>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, key) in existing {
            slots
                .entry(name)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Some(key))));
        }
    }

    fn slot(&self, name: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(name.to_string()).or_default())
    }

    /// Key of the collection called `name`, created under the configured
    /// parent on first use.
    pub async fn find_or_create(&self, name: &str) -> Result<CollectionKey, StageError> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;
        if let Some(key) = guard.as_ref() {
            return Ok(key.clone());
        }
        info!("Creating collection '{}'", name);
        let key = self.client.create_collection(name, self.parent.as_ref()).await?;
        *guard = Some(key.clone());
        Ok(key)
    }
}

// ── Null client ──────────────────────────────────────────────────────────

/// Used when no library is configured.
#[derive(Debug, Default, Clone)]
pub struct NullLibrary;

#[async_trait]
impl LibraryClient for NullLibrary {
    fn name(&self) -> &str {
        "none"
    }

    fn enabled(&self) -> bool {
        false
    }

    async fn list_collections(&self) -> Result<Vec<(String, CollectionKey)>, StageError> {
        Ok(Vec::new())
    }

    async fn create_collection(&self, name: &str, _parent: Option<&CollectionKey>) -> Result<CollectionKey, StageError> {
        Ok(CollectionKey(format!("local:{name}")))
    }

    async fn upload_item(&self, item: &LibraryItem, _collection: Option<&CollectionKey>) -> Result<ItemKey, StageError> {
        Ok(ItemKey(format!("local:{}", item.id)))
    }

    async fn attach_note(&self, item: &ItemKey, _html: &str) -> Result<NoteKey, StageError> {
        Ok(NoteKey(format!("{item}:note")))
    }

    async fn update_note(&self, _note: &NoteKey, _html: &str) -> Result<(), StageError> {
        Ok(())
    }

    async fn create_standalone_note(&self, _html: &str, _collection: Option<&CollectionKey>) -> Result<NoteKey, StageError> {
        Ok(NoteKey("local:report".into()))
    }
}

// ── Zotero ───────────────────────────────────────────────────────────────

const ZOTERO: &str = "zotero";
const PAGE_SIZE: usize = 100;

/// Zotero Web API v3 client.
pub struct ZoteroClient {
    http: reqwest::Client,
    base: String,
    api_key: String,
    timeout: Duration,
}

impl fmt::Debug for ZoteroClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoteroClient")
            .field("base", &self.base)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(default)]
    success: HashMap<String, String>,
    #[serde(default)]
    failed: HashMap<String, FailedWrite>,
}

#[derive(Debug, Deserialize)]
struct FailedWrite {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CollectionEntry {
    key: String,
    data: CollectionData,
}

#[derive(Debug, Deserialize)]
struct CollectionData {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VersionedItem {
    version: u64,
}

impl ZoteroClient {
    pub fn new(config: &LibraryConfig) -> Result<Self, DigestError> {
        let (Some(id), Some(key)) = (config.library_id.as_deref(), config.api_key.as_deref()) else {
            return Err(DigestError::InvalidConfig(
                "library.library_id and library.api_key are required for Zotero".into(),
            ));
        };
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DigestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: format!(
                "{}/{}/{}",
                config.base_url.trim_end_matches('/'),
                config.library_type.path_segment(),
                id
            ),
            api_key: key.to_string(),
            timeout,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base, path))
            .header("Zotero-API-Key", &self.api_key)
            .header("Zotero-API-Version", "3")
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, StageError> {
        let response = builder
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(ZOTERO, &e, self.timeout))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = retry_after_secs(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(StageError::from_status(ZOTERO, status, retry_after, &body))
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, response: reqwest::Response) -> Result<T, StageError> {
        response
            .json()
            .await
            .map_err(|e| StageError::from_reqwest(ZOTERO, &e, self.timeout))
    }

    /// POST one object to a write endpoint and return the created key.
    async fn create_one(&self, path: &str, object: Value) -> Result<String, StageError> {
        let response = self
            .send(self.request(reqwest::Method::POST, path).json(&json!([object])))
            .await?;
        let written: WriteResponse = self.json(response).await?;
        first_created(written)
    }
}

fn first_created(written: WriteResponse) -> Result<String, StageError> {
    if let Some(key) = written.success.get("0") {
        return Ok(key.clone());
    }
    let detail = written
        .failed
        .get("0")
        .map(|f| format!("{} {}", f.code, f.message))
        .unwrap_or_else(|| "no object created".to_string());
    Err(StageError::Rejected {
        provider: ZOTERO.into(),
        detail,
    })
}

/// `"Ada King Lovelace"` → first `"Ada"`, last `"King Lovelace"`.
fn creator(author: &str) -> Value {
    let mut parts = author.split_whitespace();
    let first = parts.next().unwrap_or_default();
    let last = parts.collect::<Vec<_>>().join(" ");
    json!({ "creatorType": "author", "firstName": first, "lastName": last })
}

fn item_json(item: &LibraryItem, collection: Option<&CollectionKey>) -> Value {
    let mut tags: Vec<&str> = item.tags.iter().map(String::as_str).collect();
    tags.sort_unstable();
    tags.dedup();
    json!({
        "itemType": "preprint",
        "title": item.title,
        "abstractNote": item.abstract_text,
        "url": item.url,
        "archiveID": format!("arXiv:{}", item.id),
        "date": item.date.clone().unwrap_or_default(),
        "creators": item.authors.iter().map(|a| creator(a)).collect::<Vec<_>>(),
        "tags": tags.iter().map(|t| json!({ "tag": t })).collect::<Vec<_>>(),
        "collections": collection.map(|c| vec![c.0.clone()]).unwrap_or_default(),
    })
}

#[async_trait]
impl LibraryClient for ZoteroClient {
    fn name(&self) -> &str {
        ZOTERO
    }

    async fn list_collections(&self) -> Result<Vec<(String, CollectionKey)>, StageError> {
        let mut all = Vec::new();
        loop {
            let path = format!("collections?limit={}&start={}", PAGE_SIZE, all.len());
            let response = self.send(self.request(reqwest::Method::GET, &path)).await?;
            let page: Vec<CollectionEntry> = self.json(response).await?;
            let n = page.len();
            all.extend(page.into_iter().map(|c| (c.data.name, CollectionKey(c.key))));
            if n < PAGE_SIZE {
                break;
            }
        }
        debug!("Zotero: {} existing collections", all.len());
        Ok(all)
    }

    async fn create_collection(&self, name: &str, parent: Option<&CollectionKey>) -> Result<CollectionKey, StageError> {
        let parent = parent.map(|p| Value::String(p.0.clone())).unwrap_or(Value::Bool(false));
        self.create_one("collections", json!({ "name": name, "parentCollection": parent }))
            .await
            .map(CollectionKey)
    }

    async fn upload_item(&self, item: &LibraryItem, collection: Option<&CollectionKey>) -> Result<ItemKey, StageError> {
        self.create_one("items", item_json(item, collection)).await.map(ItemKey)
    }

    async fn link_pdf(&self, item: &ItemKey, pdf: &Path) -> Result<(), StageError> {
        let attachment = json!({
            "itemType": "attachment",
            "linkMode": "linked_file",
            "title": pdf.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            "path": pdf.to_string_lossy(),
            "contentType": "application/pdf",
            "parentItem": item.0,
            "tags": [],
        });
        self.create_one("items", attachment).await?;
        debug!("Zotero: linked {} to {}", pdf.display(), item);
        Ok(())
    }

    async fn attach_note(&self, item: &ItemKey, html: &str) -> Result<NoteKey, StageError> {
        self.create_one(
            "items",
            json!({ "itemType": "note", "note": html, "parentItem": item.0, "tags": [] }),
        )
        .await
        .map(NoteKey)
    }

    async fn update_note(&self, note: &NoteKey, html: &str) -> Result<(), StageError> {
        let path = format!("items/{}", note.0);
        let response = self.send(self.request(reqwest::Method::GET, &path)).await?;
        let current: VersionedItem = self.json(response).await?;
        self.send(
            self.request(reqwest::Method::PATCH, &path)
                .header("If-Unmodified-Since-Version", current.version.to_string())
                .json(&json!({ "note": html })),
        )
        .await?;
        Ok(())
    }

    async fn create_standalone_note(&self, html: &str, collection: Option<&CollectionKey>) -> Result<NoteKey, StageError> {
        let collections = collection.map(|c| vec![c.0.clone()]).unwrap_or_default();
        self.create_one(
            "items",
            json!({ "itemType": "note", "note": html, "collections": collections, "tags": [] }),
        )
        .await
        .map(NoteKey)
    }
}

/// The configured library client, or [`NullLibrary`].
pub fn build_library(config: &LibraryConfig) -> Result<Arc<dyn LibraryClient>, DigestError> {
    if config.is_configured() {
        Ok(Arc::new(ZoteroClient::new(config)?))
    } else {
        Ok(Arc::new(NullLibrary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn html_note_escapes_and_breaks_lines() {
        let html = note_html("A <b> Title", "line 1\nx & y");
        assert_eq!(html, "<h1>A &lt;b&gt; Title</h1><hr>line 1<br>x &amp; y");
    }

    #[test]
    fn item_json_shape() {
        let paper = Paper::new(
            PaperMeta::new("2503.00005", "Title")
                .with_authors(["Ada King Lovelace", "Plato"])
                .with_abstract("abs"),
        );
        let item = LibraryItem::from_paper(&paper, vec!["b".into(), "a".into(), "b".into()]);
        let v = item_json(&item, Some(&CollectionKey("COLL1".into())));
        assert_eq!(v["itemType"], "preprint");
        assert_eq!(v["archiveID"], "arXiv:2503.00005");
        assert_eq!(v["creators"][0]["lastName"], "King Lovelace");
        assert_eq!(v["creators"][1]["firstName"], "Plato");
        assert_eq!(v["creators"][1]["lastName"], "");
        assert_eq!(v["tags"], json!([{ "tag": "a" }, { "tag": "b" }]));
        assert_eq!(v["collections"], json!(["COLL1"]));
    }

    #[test]
    fn write_response_success_and_failure() {
        let ok: WriteResponse = serde_json::from_str(r#"{"success": {"0": "ABCD1234"}, "unchanged": {}, "failed": {}}"#).unwrap();
        assert_eq!(first_created(ok).unwrap(), "ABCD1234");

        let bad: WriteResponse =
            serde_json::from_str(r#"{"success": {}, "failed": {"0": {"key": "", "code": 400, "message": "bad field"}}}"#)
                .unwrap();
        let err = first_created(bad).unwrap_err();
        assert!(err.to_string().contains("bad field"), "got {err}");
        assert!(!err.is_transient());
    }

    struct CountingLibrary {
        created: AtomicUsize,
    }

    #[async_trait]
    impl LibraryClient for CountingLibrary {
        fn name(&self) -> &str {
            "counting"
        }

        async fn list_collections(&self) -> Result<Vec<(String, CollectionKey)>, StageError> {
            Ok(Vec::new())
        }

        async fn create_collection(&self, name: &str, _parent: Option<&CollectionKey>) -> Result<CollectionKey, StageError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(CollectionKey(format!("key-{name}")))
        }

        async fn upload_item(&self, _: &LibraryItem, _: Option<&CollectionKey>) -> Result<ItemKey, StageError> {
            unreachable!()
        }

        async fn attach_note(&self, _: &ItemKey, _: &str) -> Result<NoteKey, StageError> {
            unreachable!()
        }

        async fn update_note(&self, _: &NoteKey, _: &str) -> Result<(), StageError> {
            unreachable!()
        }

        async fn create_standalone_note(&self, _: &str, _: Option<&CollectionKey>) -> Result<NoteKey, StageError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn concurrent_lookups_create_collection_once() {
        let client = Arc::new(CountingLibrary {
            created: AtomicUsize::new(0),
        });
        let registry = Arc::new(CollectionRegistry::new(client.clone(), None));
        registry.seed([("Existing".to_string(), CollectionKey("E1".into()))]);

        let lookups = (0..8).map(|_| {
            let r = Arc::clone(&registry);
            tokio::spawn(async move { r.find_or_create("Robotics").await })
        });
        for handle in lookups.collect::<Vec<_>>() {
            assert_eq!(handle.await.unwrap().unwrap(), CollectionKey("key-Robotics".into()));
        }
        assert_eq!(client.created.load(Ordering::SeqCst), 1);

        assert_eq!(registry.find_or_create("Existing").await.unwrap(), CollectionKey("E1".into()));
        assert_eq!(client.created.load(Ordering::SeqCst), 1);
    }
}
