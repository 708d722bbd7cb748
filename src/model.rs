use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} ({})", self.id, self.name, self.email)
    }
}

/// A user that has not been stored yet. The id is assigned by the database.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

/// Natural key of a movie. Updates and deletes address movies by this
/// triple, so two movies sharing it cannot coexist.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct MovieKey {
    pub title: String,
    pub director: String,
    pub year: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Movie {
    pub title: String,
    pub director: String,
    pub year: i32,
    pub tags: Vec<String>,
    pub ratings: Vec<i32>,
    pub favorite: bool,
    // Materialized from the reviews tree, never part of the stored record.
    #[serde(skip)]
    pub comments: Vec<String>,
}

impl Movie {
    pub fn new(title: &str, director: &str, year: i32, tags: Vec<String>) -> Self {
        Movie {
            title: title.to_owned(),
            director: director.to_owned(),
            year,
            tags,
            ratings: Vec::new(),
            favorite: false,
            comments: Vec::new(),
        }
    }

    pub fn key(&self) -> MovieKey {
        MovieKey {
            title: self.title.clone(),
            director: self.director.clone(),
            year: self.year,
        }
    }

    pub fn average_rating(&self) -> f64 {
        if self.ratings.is_empty() {
            return 0.0;
        }
        let sum: i64 = self.ratings.iter().map(|&r| i64::from(r)).sum();
        sum as f64 / self.ratings.len() as f64
    }
}

impl fmt::Display for Movie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.favorite {
            write!(f, "★ ")?;
        }
        write!(
            f,
            "{} ({}), {} [{}] ★{:.1}",
            self.title,
            self.year,
            self.director,
            self.tags.join(", "),
            self.average_rating()
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Review {
    pub movie_id: u64,
    pub user_id: u64,
    pub comment: String,
}
