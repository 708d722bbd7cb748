//! Input parsing and list operations behind the main page.

use crate::model::Movie;
use serde::{Deserialize, Serialize};

/// How many movies the recommendation list shows.
pub const RECOMMENDATIONS: usize = 5;

pub fn parse_tags(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn parse_year(input: &str) -> Option<i32> {
    input.trim().parse().ok()
}

/// Ratings outside 1..=5 are rejected here, the database stores whatever
/// it is given.
pub fn parse_rating(input: &str) -> Option<i32> {
    input
        .trim()
        .parse()
        .ok()
        .filter(|rating| (1..=5).contains(rating))
}

/// Case-insensitive substring match on title, director and tags.
pub fn matches(movie: &Movie, query: &str) -> bool {
    let query = query.to_lowercase();
    movie.title.to_lowercase().contains(&query)
        || movie.director.to_lowercase().contains(&query)
        || movie
            .tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(&query))
}

pub fn search<'a, I>(movies: I, query: &str) -> Vec<&'a (u64, Movie)>
where
    I: IntoIterator<Item = &'a (u64, Movie)>,
{
    movies
        .into_iter()
        .filter(|(_, movie)| matches(movie, query))
        .collect()
}

/// Best rated first. The sort is stable, so ties keep their order.
pub fn recommend<'a, I>(movies: I, limit: usize) -> Vec<&'a (u64, Movie)>
where
    I: IntoIterator<Item = &'a (u64, Movie)>,
{
    let mut ranked: Vec<_> = movies.into_iter().collect();
    ranked.sort_by(|(_, a), (_, b)| {
        b.average_rating()
            .partial_cmp(&a.average_rating())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(limit);
    ranked
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewMovieForm {
    pub title: String,
    pub director: String,
    pub year: String,
    pub tags: String,
}

impl NewMovieForm {
    /// Builds the movie if title, director, year and at least one tag are
    /// present.
    pub fn to_movie(&self) -> Option<Movie> {
        let title = self.title.trim();
        let director = self.director.trim();
        let year = parse_year(&self.year)?;
        let tags = parse_tags(&self.tags);
        if title.is_empty() || director.is_empty() || tags.is_empty() {
            return None;
        }
        Some(Movie::new(title, director, year, tags))
    }
}
