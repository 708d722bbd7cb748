mod catalog;
mod config;
mod database;
mod error;
mod model;

use actix_identity::{CookieIdentityPolicy, Identity, IdentityService};
use actix_web::{error as web_error, middleware::Logger, web, App, HttpResponse, HttpServer};
use catalog::*;
use config::Settings;
use database::*;
use log::debug;
use model::*;
use serde::{Deserialize, Serialize};
use std::io;

type Tera = web::Data<tera::Tera>;
type Db = web::Data<sled::Db>;
type Config = web::Data<Settings>;

fn log_error<E: std::fmt::Debug>(err: E, message: &'static str) -> web_error::Error {
    debug!("{:?}", err);
    web_error::ErrorInternalServerError(message)
}

fn redirect<S: AsRef<str>>(location: S) -> HttpResponse {
    HttpResponse::Found()
        .header("location", location.as_ref())
        .finish()
}

fn render(tera: &tera::Tera, template: &str, ctx: &tera::Context) -> actix_web::Result<HttpResponse> {
    let body = tera
        .render(template, ctx)
        .map_err(|err| log_error(err, "Template error"))?;
    Ok(HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(body))
}

fn error_message(code: &str) -> Option<&'static str> {
    match code {
        "missing_email" => Some("Please enter your email."),
        "unknown_user" => Some("No user with this email."),
        "wrong_password" => Some("Wrong password."),
        "missing_fields" => Some("Please fill in all fields."),
        "email_taken" => Some("This email is already registered."),
        "invalid_movie" => {
            Some("Title, director, a numeric year and at least one tag are required.")
        }
        "duplicate_movie" => Some("This movie is already in the catalog."),
        "missing_movie" => Some("This movie is no longer in the catalog."),
        "invalid_rating" => Some("Ratings go from 1 to 5."),
        "empty_comment" => Some("Comments cannot be empty."),
        _ => None,
    }
}

/// The identity holds the user id. Stale identities are forgotten.
fn current_user(id: &Identity, db: &sled::Db) -> actix_web::Result<Option<User>> {
    let user_id = match id.identity().map(|identity| identity.parse::<u64>()) {
        Some(Ok(user_id)) => user_id,
        Some(Err(_)) => {
            id.forget();
            return Ok(None);
        }
        None => return Ok(None),
    };
    let user = db
        .get_user(user_id)
        .map_err(|err| log_error(err, "Database error"))?;
    if user.is_none() {
        debug!("forgetting identity of unknown user {}", user_id);
        id.forget();
    }
    Ok(user)
}

#[derive(Serialize)]
struct MovieView {
    id: u64,
    title: String,
    director: String,
    year: i32,
    tags: String,
    favorite: bool,
    average: String,
    label: String,
}

impl MovieView {
    fn new(id: u64, movie: &Movie) -> Self {
        MovieView {
            id,
            title: movie.title.clone(),
            director: movie.director.clone(),
            year: movie.year,
            tags: movie.tags.join(", "),
            favorite: movie.favorite,
            average: format!("{:.1}", movie.average_rating()),
            label: movie.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MessageParams {
    error: Option<String>,
}

fn insert_error(ctx: &mut tera::Context, error: &Option<String>) {
    if let Some(message) = error.as_deref().and_then(error_message) {
        ctx.insert("error", &message);
    }
}

#[derive(Serialize, Deserialize)]
struct IndexParams {
    q: Option<String>,
    top: Option<String>,
    error: Option<String>,
}

async fn index(
    params: web::Query<IndexParams>,
    id: Identity,
    tera: Tera,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let user = match current_user(&id, &db)? {
        Some(user) => user,
        None => return Ok(redirect("/login")),
    };
    let movies = db
        .load_movies()
        .map_err(|err| log_error(err, "Database error"))?;
    let query = params.q.as_deref().map(str::trim).unwrap_or("");
    let (heading, shown) = if params.top.is_some() {
        ("Recommended", recommend(&movies, RECOMMENDATIONS))
    } else if !query.is_empty() {
        ("Search results", search(&movies, query))
    } else {
        ("Movies", movies.iter().collect())
    };
    let views = shown
        .into_iter()
        .map(|(movie_id, movie)| MovieView::new(*movie_id, movie))
        .collect::<Vec<_>>();

    let mut ctx = tera::Context::new();
    ctx.insert("user", &user.name);
    ctx.insert("heading", &heading);
    ctx.insert("query", &query);
    ctx.insert("movies", &views);
    insert_error(&mut ctx, &params.error);
    render(&tera, "index.html", &ctx)
}

async fn movie(
    path: web::Path<u64>,
    params: web::Query<MessageParams>,
    id: Identity,
    tera: Tera,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let user = match current_user(&id, &db)? {
        Some(user) => user,
        None => return Ok(redirect("/login")),
    };
    let movie_id = path.into_inner();
    let mut movie = match db
        .get_movie(movie_id)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(movie) => movie,
        None => return Ok(HttpResponse::NotFound().body("No such movie")),
    };
    movie.comments = db
        .load_reviews(&movie.key())
        .map_err(|err| log_error(err, "Database error"))?;

    let mut ctx = tera::Context::new();
    ctx.insert("user", &user.name);
    ctx.insert("movie", &MovieView::new(movie_id, &movie));
    ctx.insert("ratings", &movie.ratings.len());
    ctx.insert("comments", &movie.comments);
    insert_error(&mut ctx, &params.error);
    render(&tera, "movie.html", &ctx)
}

async fn login(params: web::Query<MessageParams>, tera: Tera) -> actix_web::Result<HttpResponse> {
    let mut ctx = tera::Context::new();
    insert_error(&mut ctx, &params.error);
    render(&tera, "login.html", &ctx)
}

#[derive(Serialize, Deserialize)]
struct LoginParams {
    email: String,
    password: String,
}

async fn login_post(
    params: web::Form<LoginParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let email = params.email.trim();
    if email.is_empty() {
        return Ok(redirect("/login?error=missing_email"));
    }
    let user = match db
        .get_user_by_email(email)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(user) => user,
        None => return Ok(redirect("/login?error=unknown_user")),
    };
    if bcrypt::verify(&params.password, &user.password_hash)
        .map_err(|err| log_error(err, "Verification error"))?
    {
        id.remember(user.id.to_string());
        return Ok(redirect("/"));
    }
    Ok(redirect("/login?error=wrong_password"))
}

async fn register(params: web::Query<MessageParams>, tera: Tera) -> actix_web::Result<HttpResponse> {
    let mut ctx = tera::Context::new();
    insert_error(&mut ctx, &params.error);
    render(&tera, "register.html", &ctx)
}

#[derive(Serialize, Deserialize)]
struct RegisterParams {
    name: String,
    email: String,
    password: String,
}

async fn register_post(
    params: web::Form<RegisterParams>,
    id: Identity,
    db: Db,
    config: Config,
) -> actix_web::Result<HttpResponse> {
    let name = params.name.trim();
    let email = params.email.trim();
    if name.is_empty() || email.is_empty() || params.password.is_empty() {
        return Ok(redirect("/register?error=missing_fields"));
    }
    if db
        .email_exists(email)
        .map_err(|err| log_error(err, "Database error"))?
    {
        return Ok(redirect("/register?error=email_taken"));
    }
    let password_hash = bcrypt::hash(&params.password, config.bcrypt_cost)
        .map_err(|err| log_error(err, "Hashing error"))?;
    let user = NewUser {
        name: name.to_owned(),
        email: email.to_owned(),
        password_hash,
    };
    match db
        .add_user(user)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(user_id) => {
            id.remember(user_id.to_string());
            Ok(redirect("/"))
        }
        None => Ok(redirect("/register?error=email_taken")),
    }
}

async fn logout(id: Identity) -> actix_web::Result<HttpResponse> {
    id.forget();
    Ok(redirect("/login"))
}

async fn add_movie(
    params: web::Form<NewMovieForm>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    if current_user(&id, &db)?.is_none() {
        return Ok(redirect("/login"));
    }
    let movie = match params.to_movie() {
        Some(movie) => movie,
        None => return Ok(redirect("/?error=invalid_movie")),
    };
    match db
        .add_movie(&movie)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(_) => Ok(redirect("/")),
        None => Ok(redirect("/?error=duplicate_movie")),
    }
}

#[derive(Serialize, Deserialize)]
struct MovieKeyParams {
    title: String,
    director: String,
    year: i32,
}

impl MovieKeyParams {
    fn key(&self) -> MovieKey {
        MovieKey {
            title: self.title.clone(),
            director: self.director.clone(),
            year: self.year,
        }
    }
}

async fn delete_movie(
    params: web::Form<MovieKeyParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    if current_user(&id, &db)?.is_none() {
        return Ok(redirect("/login"));
    }
    if db
        .delete_movie(&params.key())
        .map_err(|err| log_error(err, "Database error"))?
    {
        Ok(redirect("/"))
    } else {
        Ok(redirect("/?error=missing_movie"))
    }
}

#[derive(Serialize, Deserialize)]
struct FavoriteParams {
    title: String,
    director: String,
    year: i32,
    favorite: bool,
}

async fn set_favorite(
    params: web::Form<FavoriteParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    if current_user(&id, &db)?.is_none() {
        return Ok(redirect("/login"));
    }
    let key = MovieKey {
        title: params.title.clone(),
        director: params.director.clone(),
        year: params.year,
    };
    if db
        .set_favorite(&key, params.favorite)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Ok(redirect("/"))
    } else {
        Ok(redirect("/?error=missing_movie"))
    }
}

#[derive(Serialize, Deserialize)]
struct RateParams {
    title: String,
    director: String,
    year: i32,
    rating: String,
}

async fn rate_movie(
    params: web::Form<RateParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    if current_user(&id, &db)?.is_none() {
        return Ok(redirect("/login"));
    }
    let key = MovieKey {
        title: params.title.clone(),
        director: params.director.clone(),
        year: params.year,
    };
    let movie_id = match db
        .get_movie_id(&key)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(movie_id) => movie_id,
        None => return Ok(redirect("/?error=missing_movie")),
    };
    let rating = match parse_rating(&params.rating) {
        Some(rating) => rating,
        None => return Ok(redirect(format!("/movies/{}?error=invalid_rating", movie_id))),
    };
    let mut movie = match db
        .get_movie(movie_id)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(movie) => movie,
        None => return Ok(redirect("/?error=missing_movie")),
    };
    // Whole-row rewrite: a rating submitted concurrently for the same movie
    // can be lost.
    movie.ratings.push(rating);
    if db
        .update_movie_ratings(&key, &movie.ratings)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Ok(redirect(format!("/movies/{}", movie_id)))
    } else {
        Ok(redirect("/?error=missing_movie"))
    }
}

#[derive(Serialize, Deserialize)]
struct CommentParams {
    title: String,
    director: String,
    year: i32,
    comment: String,
}

async fn comment_movie(
    params: web::Form<CommentParams>,
    id: Identity,
    db: Db,
) -> actix_web::Result<HttpResponse> {
    let user = match current_user(&id, &db)? {
        Some(user) => user,
        None => return Ok(redirect("/login")),
    };
    let key = MovieKey {
        title: params.title.clone(),
        director: params.director.clone(),
        year: params.year,
    };
    let movie_id = match db
        .get_movie_id(&key)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(movie_id) => movie_id,
        None => return Ok(redirect("/?error=missing_movie")),
    };
    let comment = params.comment.trim();
    if comment.is_empty() {
        return Ok(redirect(format!("/movies/{}?error=empty_comment", movie_id)));
    }
    match db
        .add_review(&key, user.id, comment)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(_) => Ok(redirect(format!("/movies/{}", movie_id))),
        None => Ok(redirect("/?error=missing_movie")),
    }
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/login", web::get().to(login))
        .route("/login", web::post().to(login_post))
        .route("/register", web::get().to(register))
        .route("/register", web::post().to(register_post))
        .route("/logout", web::get().to(logout))
        .route("/movies", web::post().to(add_movie))
        .route("/movies/delete", web::post().to(delete_movie))
        .route("/movies/favorite", web::post().to(set_favorite))
        .route("/movies/rate", web::post().to(rate_movie))
        .route("/movies/comment", web::post().to(comment_movie))
        .route("/movies/{id}", web::get().to(movie));
}

fn identity_service(key: &[u8]) -> IdentityService<CookieIdentityPolicy> {
    IdentityService::new(
        CookieIdentityPolicy::new(key)
            .name("auth-cookie")
            .secure(false),
    )
}

#[actix_rt::main]
async fn main() -> io::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("kinoflix=debug,actix_web=info"),
    )
    .init();

    let settings =
        Settings::from_env().map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let db = database::open(&settings.database_path)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let users = db
        .load_users()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let max_user_id = db
        .max_user_id()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    log::info!("{} registered users, highest id {}", users.len(), max_user_id);
    let tera = tera::Tera::new(&settings.templates)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    log::info!("listening on {}", settings.bind_address);

    let bind_address = settings.bind_address.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(identity_service(&settings.cookie_key))
            .data(tera.clone())
            .data(db.clone())
            .data(settings.clone())
            .configure(routes)
    })
    .bind(bind_address)?
    .run()
    .await
}
