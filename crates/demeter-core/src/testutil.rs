//! Test utilities: mock implementations of the boundary traits and the
//! HTML fixtures shared across driver and engine tests.
//!
//! Handwritten mocks for dependency injection; all use `Arc<Mutex<_>>`
//! for interior mutability so tests can assert on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use url::Url;

use crate::drivers::FetchedPage;
use crate::error::AppError;
use crate::records::{ExtractedRecord, RelationshipRecord};
use crate::store::KeyedStore;
use crate::traits::{
    FetchResponse, Fetcher, NetworkRequest, PersistenceSink, RenderClient, RenderedPage,
};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum CannedResponse {
    Page { status: u16, body: String },
    NetworkError(String),
}

impl CannedResponse {
    fn realize(&self, url: &str) -> Result<FetchResponse, AppError> {
        match self {
            CannedResponse::Page { status, body } => Ok(FetchResponse {
                status: *status,
                body: body.clone(),
                final_url: url.to_string(),
            }),
            CannedResponse::NetworkError(msg) => Err(AppError::NetworkError(msg.clone())),
        }
    }
}

/// Mock fetcher that routes canned responses by exact URL and records
/// every fetch in order.
///
/// Each URL holds a queue; responses pop until one remains, which then
/// repeats — so a single `route` serves any number of fetches while a
/// sequence models flaky behavior (error, then success).
#[derive(Clone, Default)]
pub struct MockFetcher {
    routes: Arc<Mutex<HashMap<String, Vec<CannedResponse>>>>,
    pub fetched: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, body: &str) -> Self {
        self.push(url, CannedResponse::Page {
            status: 200,
            body: body.to_string(),
        });
        self
    }

    pub fn route_status(self, url: &str, status: u16, body: &str) -> Self {
        self.push(url, CannedResponse::Page {
            status,
            body: body.to_string(),
        });
        self
    }

    pub fn route_network_error(self, url: &str, message: &str) -> Self {
        self.push(url, CannedResponse::NetworkError(message.to_string()));
        self
    }

    fn push(&self, url: &str, response: CannedResponse) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push(response);
    }

    /// URLs fetched so far, in completion order.
    pub fn fetched_urls(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, AppError> {
        self.fetched.lock().unwrap().push(url.to_string());

        let canned = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(url) {
                Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
                Some(queue) => queue.first().cloned(),
                None => None,
            }
        };

        match canned {
            Some(response) => response.realize(url),
            None => Ok(FetchResponse {
                status: 404,
                body: String::new(),
                final_url: url.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MockRenderer
// ---------------------------------------------------------------------------

/// Mock render collaborator returning a fixed DOM plus observed requests.
#[derive(Clone)]
pub struct MockRenderer {
    result: Arc<Mutex<Result<RenderedPage, String>>>,
}

impl MockRenderer {
    pub fn new(html: &str, network_requests: Vec<NetworkRequest>) -> Self {
        Self {
            result: Arc::new(Mutex::new(Ok(RenderedPage {
                html: html.to_string(),
                network_requests,
            }))),
        }
    }

    pub fn with_error(message: &str) -> Self {
        Self {
            result: Arc::new(Mutex::new(Err(message.to_string()))),
        }
    }
}

impl RenderClient for MockRenderer {
    async fn render(&self, _url: &str) -> Result<RenderedPage, AppError> {
        match &*self.result.lock().unwrap() {
            Ok(page) => Ok(page.clone()),
            Err(msg) => Err(AppError::RenderError(msg.clone())),
        }
    }
}

/// Convenience constructor for an XHR network request.
pub fn xhr(url: &str) -> NetworkRequest {
    NetworkRequest {
        method: "GET".to_string(),
        url: url.to_string(),
        resource_type: "XHR".to_string(),
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

/// Mock persistence sink recording every upsert.
#[derive(Clone, Default)]
pub struct MockSink {
    pub records: Arc<Mutex<Vec<ExtractedRecord>>>,
    pub relationships: Arc<Mutex<Vec<RelationshipRecord>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn natural_keys(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.natural_key.clone())
            .collect()
    }
}

impl PersistenceSink for MockSink {
    async fn upsert(&self, record: &ExtractedRecord) -> Result<(), AppError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn upsert_relationship(
        &self,
        relationship: &RelationshipRecord,
    ) -> Result<(), AppError> {
        self.relationships.lock().unwrap().push(relationship.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

/// Keyed store that always errors, for fail-open tests.
#[derive(Clone, Copy, Default)]
pub struct FailingStore;

impl KeyedStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, AppError> {
        Err(AppError::StoreError("store unreachable".to_string()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), AppError> {
        Err(AppError::StoreError("store unreachable".to_string()))
    }

    async fn increment(&self, _key: &str, _ttl: Option<Duration>) -> Result<i64, AppError> {
        Err(AppError::StoreError("store unreachable".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Build a [`FetchedPage`] for direct driver tests.
pub fn page(url: &str, body: &str) -> FetchedPage {
    FetchedPage {
        url: Url::parse(url).unwrap(),
        status: 200,
        body: body.to_string(),
    }
}

/// Standards listing: two well-formed rows, one row whose link carries no
/// identifier, and a next-page link.
pub const STANDARD_LISTING_PAGE: &str = r#"
<html><body>
  <table>
    <thead><tr><th>Código</th><th>Título</th><th>Sector</th></tr></thead>
    <tbody>
      <tr>
        <td><a href="/registro/detalle?id=EC0217">EC0217</a></td>
        <td>Impartición de cursos de formación del capital humano</td>
        <td>Educación</td>
      </tr>
      <tr>
        <td><a href="/registro/detalle?id=EC0301">EC0301</a></td>
        <td>Diseño de cursos de formación del capital humano</td>
        <td>Educación</td>
      </tr>
      <tr>
        <td><a href="/registro/detalle">&nbsp;</a></td>
        <td>Fila con enlace sin identificador</td>
        <td></td>
      </tr>
    </tbody>
  </table>
  <a rel="next" href="?page=2">Siguiente</a>
</body></html>
"#;

/// Second (final) standards listing page: one row, no next link.
pub const STANDARD_LISTING_PAGE_2: &str = r#"
<html><body>
  <table>
    <thead><tr><th>Código</th><th>Título</th><th>Sector</th></tr></thead>
    <tbody>
      <tr>
        <td><a href="/registro/detalle?id=EC0305">EC0305</a></td>
        <td>Prestación de servicios de atención a comensales</td>
        <td>Turismo</td>
      </tr>
    </tbody>
  </table>
</body></html>
"#;

/// Standard detail page with labeled rows and relationship sources.
pub const STANDARD_DETAIL_PAGE: &str = r#"
<html><body>
  <h1>EC0217</h1>
  <table>
    <tr><th>Código:</th><td>EC0217</td></tr>
    <tr><th>Título:</th><td>Impartición de cursos de formación del capital humano de manera presencial grupal</td></tr>
    <tr><th>Propósito:</th><td>Servir como referente para la evaluación y certificación de las personas que imparten cursos.</td></tr>
    <tr><th>Nivel:</th><td>3</td></tr>
    <tr><th>Sector:</th><td>Educación y formación</td></tr>
    <tr><th>Comité:</th><td>Gestión y desarrollo de capital humano</td></tr>
    <tr><th>Fecha de publicación:</th><td>2012-07-11</td></tr>
  </table>
</body></html>
"#;

/// Certifier detail page: contact block plus accredited standards.
pub const CERTIFIER_DETAIL_PAGE: &str = r#"
<html><body>
  <table>
    <tr><th>Clave:</th><td>ECE001-99</td></tr>
    <tr><th>Nombre:</th><td>Instituto Nacional de Certificación de Competencias</td></tr>
    <tr><th>Responsable:</th><td>María Pérez</td></tr>
    <tr><th>Teléfono:</th><td>55 1234 5678</td></tr>
    <tr><th>Correo electrónico:</th><td>contacto@incc.example.mx</td></tr>
    <tr><th>Estado:</th><td>CDMX</td></tr>
    <tr><th>Domicilio:</th><td>Av. Reforma 100, Col. Centro</td></tr>
  </table>
  <h2>Estándares acreditados</h2>
  <ul class="estandares">
    <li>EC0217 — Impartición de cursos de formación</li>
    <li>EC0301 — Diseño de cursos de formación</li>
  </ul>
</body></html>
"#;

/// Centers listing: three rows with identifiers, one without.
pub const CENTER_LISTING_PAGE: &str = r#"
<html><body>
  <table>
    <thead><tr><th>Centro</th><th>Estado</th></tr></thead>
    <tbody>
      <tr><td><a href="/registro/centro?id=CE0001-13">Centro de Evaluación Norte</a></td><td>Nuevo León</td></tr>
      <tr><td><a href="/registro/centro?id=CE0002-13">Centro de Evaluación Centro</a></td><td>CDMX</td></tr>
      <tr><td><a href="/registro/centro?id=CE0003-14">Centro de Evaluación Sur</a></td><td>Chiapas</td></tr>
      <tr><td><a href="/registro/centro">Centro sin clave publicada</a></td><td>Jalisco</td></tr>
    </tbody>
  </table>
</body></html>
"#;

/// Sector detail page embedding two committees (and one inert item).
pub const SECTOR_DETAIL_PAGE: &str = r#"
<html><body>
  <table>
    <tr><th>Sector:</th><td>Educación</td></tr>
    <tr><th>Clave:</th><td>3</td></tr>
  </table>
  <ul class="comites">
    <li><a href="/registro/comite?comite=31">Comité de Gestión Educativa</a></li>
    <li><a href="/registro/comite?comite=32">Comité de Formación Continua</a></li>
    <li>Entrada sin enlace</li>
  </ul>
</body></html>
"#;
