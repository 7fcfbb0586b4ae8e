//! Reference catalogs: the items, locations and question templates a user
//! picks from. Sources are one-shot; the loaded [`Catalog`] is static for the
//! lifetime of a widget.

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{ChatError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requires_location: bool,
    #[serde(default)]
    pub requires_item: bool,
}

impl QuestionTemplate {
    /// Text that placeholders are substituted into: the description, or the
    /// name when the description is missing or empty.
    pub fn source_text(&self) -> &str {
        match self.description.as_deref() {
            Some(description) if !description.is_empty() => description,
            _ => &self.name,
        }
    }
}

/// Read-only access to the three reference lists.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_items(&self) -> Result<Vec<Item>>;
    async fn list_locations(&self) -> Result<Vec<Location>>;
    async fn list_question_templates(&self) -> Result<Vec<QuestionTemplate>>;
}

/// Catalog backed by `items.csv`, `locations.csv` and `questions.csv` in one directory.
///
/// Columns are found by header name (`id`, `name`, `category`/`type`,
/// `description`, `requires_location`, `requires_item`). Rows without an `id`
/// column get `{prefix}-{index}` by position.
#[derive(Debug, Clone)]
pub struct CsvCatalog {
    dir: PathBuf,
}

impl CsvCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn table(&self, catalog: &'static str, file: &str) -> Result<Table> {
        let path = self.dir.join(file);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ChatError::catalog(catalog, format!("{}: {}", path.display(), e)))?;
        Table::parse(catalog, &text)
    }
}

/// Parsed CSV file: trimmed header names and non-blank rows.
#[derive(Debug, PartialEq, Eq)]
struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn parse(catalog: &'static str, text: &str) -> Result<Self> {
        let text = text.trim_start_matches('\u{FEFF}');
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| ChatError::catalog(catalog, e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| ChatError::catalog(catalog, e))?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            rows.push(record.iter().map(str::to_string).collect());
        }
        debug!("Parsed {} {} rows", rows.len(), catalog);
        Ok(Self { headers, rows })
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.eq_ignore_ascii_case(name))
    }

    /// `(id, name, group)` per row. Without a `name` header the first
    /// non-id column is the name and the one after it the group.
    fn named_records(&self, prefix: &str, group: &str) -> Vec<(String, String, String)> {
        let id_column = self.column("id");
        let name_column = self
            .column("name")
            .unwrap_or(if id_column == Some(0) { 1 } else { 0 });
        let group_column = self.column(group).unwrap_or(name_column + 1);

        self.rows
            .iter()
            .enumerate()
            .filter_map(|(index, row)| {
                let name = row.get(name_column).filter(|n| !n.is_empty())?.clone();
                let id = id_column
                    .and_then(|c| row.get(c))
                    .filter(|id| !id.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("{}-{}", prefix, index));
                let group = row.get(group_column).cloned().unwrap_or_default();
                Some((id, name, group))
            })
            .collect()
    }
}

fn parse_flag(value: Option<&String>) -> bool {
    matches!(
        value.map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("true" | "1" | "yes")
    )
}

#[async_trait]
impl CatalogSource for CsvCatalog {
    async fn list_items(&self) -> Result<Vec<Item>> {
        let table = self.table("items", "items.csv").await?;
        Ok(table
            .named_records("item", "category")
            .into_iter()
            .map(|(id, name, category)| Item { id, name, category })
            .collect())
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        let table = self.table("locations", "locations.csv").await?;
        Ok(table
            .named_records("location", "type")
            .into_iter()
            .map(|(id, name, kind)| Location { id, name, kind })
            .collect())
    }

    async fn list_question_templates(&self) -> Result<Vec<QuestionTemplate>> {
        let table = self.table("questions", "questions.csv").await?;
        let column = |name: &str, fallback: usize| table.column(name).unwrap_or(fallback);
        let (id, name, description) = (column("id", 0), column("name", 1), column("description", 2));
        let (requires_location, requires_item) =
            (column("requires_location", 3), column("requires_item", 4));

        let mut templates = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let (Some(id), Some(name)) = (row.get(id), row.get(name)) else {
                warn!("Skipping question row without id and name: {:?}", row);
                continue;
            };
            templates.push(QuestionTemplate {
                id: id.clone(),
                name: name.clone(),
                description: row.get(description).filter(|d| !d.is_empty()).cloned(),
                requires_location: parse_flag(row.get(requires_location)),
                requires_item: parse_flag(row.get(requires_item)),
            });
        }
        Ok(templates)
    }
}

/// Catalog served over HTTP as JSON arrays at `{base}/items`, `{base}/locations`
/// and `{base}/questions`.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    #[instrument(skip(self))]
    async fn fetch<T: DeserializeOwned>(&self, catalog: &'static str, path: &str) -> Result<Vec<T>> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChatError::Timeout(format!("GET {}", url))
                } else {
                    ChatError::catalog(catalog, e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, %url, "Catalog request failed");
            return Err(ChatError::catalog(catalog, format!("status {}", status)));
        }

        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| ChatError::catalog(catalog, format!("malformed response: {}", e)))
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn list_items(&self) -> Result<Vec<Item>> {
        self.fetch("items", "items").await
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        self.fetch("locations", "locations").await
    }

    async fn list_question_templates(&self) -> Result<Vec<QuestionTemplate>> {
        self.fetch("questions", "questions").await
    }
}

/// The loaded reference lists plus any notices about lists that failed to load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    pub items: Vec<Item>,
    pub locations: Vec<Location>,
    pub templates: Vec<QuestionTemplate>,
    /// User-visible messages for lists that degraded to empty.
    pub notices: Vec<String>,
}

impl Catalog {
    /// Fetch all three lists. A failing list is left empty and reported in
    /// `notices`; the others load normally.
    pub async fn load(source: &dyn CatalogSource) -> Self {
        let (items, locations, templates) = tokio::join!(
            source.list_items(),
            source.list_locations(),
            source.list_question_templates()
        );

        let mut notices = Vec::new();
        let items = or_empty(items, &mut notices);
        let locations = or_empty(locations, &mut notices);
        let templates = or_empty(templates, &mut notices);

        info!(
            "Catalog loaded: {} items, {} locations, {} templates",
            items.len(),
            locations.len(),
            templates.len()
        );

        Self {
            items,
            locations,
            templates,
            notices,
        }
    }

    pub fn template(&self, id: &str) -> Option<&QuestionTemplate> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// Distinct item categories in first-seen order.
    pub fn categories(&self) -> Vec<&str> {
        distinct(self.items.iter().map(|i| i.category.as_str()))
    }

    /// Distinct location types in first-seen order.
    pub fn location_types(&self) -> Vec<&str> {
        distinct(self.locations.iter().map(|l| l.kind.as_str()))
    }

    /// Items in `category`; an empty category means all items.
    pub fn items_in<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a Item> + 'a {
        self.items
            .iter()
            .filter(move |i| category.is_empty() || i.category == category)
    }

    /// Locations of `kind`; an empty kind means all locations.
    pub fn locations_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Location> + 'a {
        self.locations
            .iter()
            .filter(move |l| kind.is_empty() || l.kind == kind)
    }

    /// Map selector option ids to display names. Unknown ids pass through.
    pub fn resolve_item_names<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        ids.iter()
            .map(|id| {
                let id = id.as_ref();
                self.items
                    .iter()
                    .find(|i| i.id == id)
                    .map_or_else(|| id.to_string(), |i| i.name.clone())
            })
            .collect()
    }

    /// Map selector option ids to display names. Unknown ids pass through.
    pub fn resolve_location_names<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        ids.iter()
            .map(|id| {
                let id = id.as_ref();
                self.locations
                    .iter()
                    .find(|l| l.id == id)
                    .map_or_else(|| id.to_string(), |l| l.name.clone())
            })
            .collect()
    }
}

fn or_empty<T>(result: Result<Vec<T>>, notices: &mut Vec<String>) -> Vec<T> {
    result.unwrap_or_else(|e| {
        warn!("{}", e);
        notices.push(e.to_string());
        Vec::new()
    })
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen: Vec<&str> = Vec::new();
    for value in values {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}
