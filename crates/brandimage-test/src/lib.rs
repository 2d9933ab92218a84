//! Provides test infrastructure for the image resolution crates.
//!
//!  - Use [`ImageOrigin`] to spawn an HTTP server that serves brand images and counts the
//!    requests it receives. Register images with [`ImageOrigin::add_image`]; every other image
//!    path answers `404 Not Found`.
//!  - Call [`setup`] at the start of a test to capture logs in the test runner.
//!
//! Besides images, the origin has a few routes that misbehave on purpose:
//!
//!  - `/respond_statuscode/:num/*tail` answers with the given status code.
//!  - `/garbage_data/*tail` answers `200 OK` with a plain text body.
//!  - `/delay/:time/*path` waits for a [`humantime`] duration, then redirects to `/path`.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, OriginalUri, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use reqwest::{StatusCode, Url};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
/// Initializes logs: the logger only captures logs from the image crates.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "brandimage_service=trace,brandimagecli=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses the loopback address the server is bound to, so no resolver is involved.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.socket, path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;
type Images = Arc<Mutex<BTreeSet<String>>>;

/// The bytes served for every image. Nobody looks at them.
const IMAGE_DATA: &[u8] = b"RIFF\x1a\x00\x00\x00WEBPVP8L\x0d\x00\x00\x00/\x00\x00\x00\x10\x07\x10\x11\x11\x88\x88\xfe\x07\x00";

/// An image origin laid out like the CDN, counting the requests it gets.
pub struct ImageOrigin {
    server: Server,
    hits: Hits,
    images: Images,
}

impl ImageOrigin {
    pub fn new() -> Self {
        let hits = Hits::default();
        let images = Images::default();

        let router = Router::new()
            .route(
                "/brand-images/*path",
                get(
                    |State(images): State<Images>, extract::Path(path): extract::Path<String>| async move {
                        serve_image(&images, &path)
                    },
                ),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .with_state(images.clone())
            .layer(middleware::from_fn_with_state(hits.clone(), count_hits));

        let server = Server::with_router(router);

        Self {
            server,
            hits,
            images,
        }
    }

    /// Makes the origin serve the primary image of `sku` in the `brand` folder.
    pub fn add_image(&self, brand: &str, sku: &str) {
        self.add_file(brand, &format!("{sku}_1.webp"));
    }

    /// Makes the origin serve `file_name` in the `brand` folder.
    pub fn add_file(&self, brand: &str, file_name: &str) {
        self.images
            .lock()
            .unwrap()
            .insert(format!("{brand}/{file_name}"));
    }

    /// Returns the number of requests since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the requests per path since the last call, and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for ImageOrigin {
    fn default() -> Self {
        Self::new()
    }
}

fn serve_image(images: &Images, path: &str) -> Response {
    if images.lock().unwrap().contains(path) {
        ([(header::CONTENT_TYPE, "image/webp")], IMAGE_DATA).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn count_hits(
    State(hits): State<Hits>,
    OriginalUri(uri): OriginalUri,
    req: Request,
    next: Next,
) -> Response {
    {
        let mut hits = hits.lock().unwrap();
        let hits = hits.entry(uri.to_string()).or_default();
        *hits += 1;
    }

    next.run(req).await
}
