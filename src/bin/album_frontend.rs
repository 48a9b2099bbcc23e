//! Stateless HTML frontend.
//!
//! Serves the album table and add/edit/delete forms, translating each form
//! submission into a data-plane request. Leader discovery is entirely the
//! data client's problem: the frontend keeps no cluster state of its own.

use album_raft::{Album, ClientError, DataClient};
use axum::extract::{Form, Path, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::Deserialize;
use slog::Drain;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "album-frontend", about = "HTML frontend for the album store")]
struct Args {
    /// Address to serve HTTP on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Backend replica addresses (any order; the client chases the leader).
    #[arg(long, value_delimiter = ',', required = true)]
    backends: Vec<String>,
}

struct App {
    logger: slog::Logger,
    client: DataClient,
}

#[derive(Deserialize)]
struct AlbumForm {
    #[serde(default)]
    title: String,
    #[serde(default)]
    artist: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    year: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let logger = term_logger();

    let client = DataClient::new(
        logger.new(slog::o!("component" => "client")),
        args.backends,
    );
    let app = Arc::new(App {
        logger: logger.clone(),
        client,
    });

    let router = Router::new()
        .route("/", get(home))
        .route("/add", get(add_page).post(add_album))
        .route("/album/:id", get(album_page))
        .route("/edit/:id", post(edit_album))
        .route("/delete/:id", post(delete_album))
        .with_state(app);

    let listener = match tokio::net::TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            slog::crit!(logger, "failed to bind"; "addr" => %args.listen, "error" => %e);
            std::process::exit(1);
        }
    };
    slog::info!(logger, "frontend listening"; "addr" => %args.listen);

    if let Err(e) = axum::serve(listener, router).await {
        slog::crit!(logger, "server error"; "error" => %e);
        std::process::exit(1);
    }
}

async fn home(State(app): State<Arc<App>>) -> Response {
    match app.client.get_all_albums().await {
        Ok(albums) => Html(render_home(&albums)).into_response(),
        Err(e) => unavailable(&app, e),
    }
}

async fn add_page() -> Html<String> {
    Html(render_add_form())
}

async fn album_page(State(app): State<Arc<App>>, Path(id): Path<String>) -> Response {
    match app.client.get_album(&id).await {
        Ok(Some(album)) => Html(render_album(&album)).into_response(),
        Ok(None) => Html(render_message("No such album")).into_response(),
        Err(e) => unavailable(&app, e),
    }
}

async fn add_album(State(app): State<Arc<App>>, Form(form): Form<AlbumForm>) -> Response {
    match app
        .client
        .add_album(&form.title, &form.artist, &form.url, &form.year)
        .await
    {
        Ok(_) => Redirect::to("/").into_response(),
        Err(e) => unavailable(&app, e),
    }
}

async fn edit_album(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    Form(form): Form<AlbumForm>,
) -> Response {
    match app
        .client
        .edit_album(&id, &form.title, &form.artist, &form.url, &form.year)
        .await
    {
        Ok(_) => Redirect::to("/").into_response(),
        Err(e) => unavailable(&app, e),
    }
}

async fn delete_album(State(app): State<Arc<App>>, Path(id): Path<String>) -> Response {
    match app.client.delete_album(&id).await {
        Ok(_) => Redirect::to("/").into_response(),
        Err(e) => unavailable(&app, e),
    }
}

fn unavailable(app: &App, e: ClientError) -> Response {
    slog::warn!(app.logger, "cluster unavailable"; "error" => %e);
    (
        axum::http::StatusCode::BAD_GATEWAY,
        Html(render_message("The album store is unavailable; try again shortly.")),
    )
        .into_response()
}

// ----------------------------------------------------------------------
// Rendering
// ----------------------------------------------------------------------

fn render_home(albums: &[Album]) -> String {
    let mut rows = String::new();
    for album in albums {
        rows.push_str(&format!(
            concat!(
                "<tr><td><a href=\"/album/{id}\">{title}</a></td>",
                "<td>{artist}</td><td>{year}</td>",
                "<td><form method=\"post\" action=\"/delete/{id}\">",
                "<button type=\"submit\">delete</button></form></td></tr>\n"
            ),
            id = escape(&album.id),
            title = escape(&album.title),
            artist = escape(&album.artist),
            year = escape(&album.year),
        ));
    }

    page(
        "Albums",
        &format!(
            concat!(
                "<h1>Albums</h1>",
                "<table><tr><th>Title</th><th>Artist</th><th>Year</th><th></th></tr>{}</table>",
                "<p><a href=\"/add\">Add an album</a></p>"
            ),
            rows
        ),
    )
}

fn render_album(album: &Album) -> String {
    page(
        &album.title,
        &format!(
            concat!(
                "<h1>{title}</h1>",
                "<p>{artist} ({year})</p>",
                "<p><img src=\"{url}\" alt=\"cover\" width=\"300\"></p>",
                "<h2>Edit</h2>",
                "<form method=\"post\" action=\"/edit/{id}\">",
                "<p><input name=\"title\" placeholder=\"title\"></p>",
                "<p><input name=\"artist\" placeholder=\"artist\"></p>",
                "<p><input name=\"url\" placeholder=\"cover url\"></p>",
                "<p><input name=\"year\" placeholder=\"year\"></p>",
                "<p><button type=\"submit\">Save (empty fields keep current values)</button></p>",
                "</form>",
                "<p><a href=\"/\">Back</a></p>"
            ),
            id = escape(&album.id),
            title = escape(&album.title),
            artist = escape(&album.artist),
            year = escape(&album.year),
            url = escape(&album.url),
        ),
    )
}

fn render_add_form() -> String {
    page(
        "Add album",
        concat!(
            "<h1>Add album</h1>",
            "<form method=\"post\" action=\"/add\">",
            "<p><input name=\"title\" placeholder=\"title\"></p>",
            "<p><input name=\"artist\" placeholder=\"artist\"></p>",
            "<p><input name=\"url\" placeholder=\"cover url\"></p>",
            "<p><input name=\"year\" placeholder=\"year\"></p>",
            "<p><button type=\"submit\">Add</button></p>",
            "</form>",
            "<p><a href=\"/\">Back</a></p>"
        ),
    )
}

fn render_message(message: &str) -> String {
    page(
        "Albums",
        &format!("<p>{}</p><p><a href=\"/\">Back</a></p>", escape(message)),
    )
}

fn page(title: &str, body: &str) -> String {
    format!(
        concat!(
            "<!doctype html><html><head><meta charset=\"utf-8\">",
            "<title>{}</title></head><body>{}</body></html>"
        ),
        escape(title),
        body
    )
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn term_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}
