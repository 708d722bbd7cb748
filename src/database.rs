use crate::error::{DbError, DbResult};
use crate::model::*;
use sled::transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, Transactional,
};
use std::path::Path;

// Ids are stored big endian so that tree order is id order.
fn serialize_id(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn deserialize_id<V: AsRef<[u8]>>(id: V) -> DbResult<u64> {
    use std::convert::TryInto;
    let bytes = id.as_ref();
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| DbError::BadId(bytes.len()))
}

fn movie_key_bytes(key: &MovieKey) -> DbResult<Vec<u8>> {
    Ok(bincode::serialize(&(&key.title, &key.director, key.year))?)
}

fn review_key(movie_id: u64, review_id: u64) -> Vec<u8> {
    let mut key = serialize_id(movie_id).to_vec();
    key.extend_from_slice(&serialize_id(review_id));
    key
}

/// Why a transaction gave up.
enum Abort {
    /// Uniqueness violated or the addressed record is gone. Nothing changed.
    Refused,
    Failed(DbError),
}

fn failed<E: Into<DbError>>(err: E) -> ConflictableTransactionError<Abort> {
    ConflictableTransactionError::Abort(Abort::Failed(err.into()))
}

fn refused<T>() -> ConflictableTransactionResult<T, Abort> {
    abort(Abort::Refused)
}

fn finish<T>(res: TransactionResult<T, Abort>) -> DbResult<Option<T>> {
    match res {
        Ok(value) => Ok(Some(value)),
        Err(TransactionError::Abort(Abort::Refused)) => Ok(None),
        Err(TransactionError::Abort(Abort::Failed(err))) => Err(err),
        Err(TransactionError::Storage(err)) => Err(err.into()),
    }
}

const USERS: &'static [u8] = b"users";
const USERS_EMAIL: &'static [u8] = b"users_email";
const MOVIES: &'static [u8] = b"movies";
const MOVIES_KEY: &'static [u8] = b"movies_key";
const REVIEWS: &'static [u8] = b"reviews";

/// Opens the catalog stored at `path`, creating it if necessary. Trees are
/// created lazily by the first operation touching them.
pub fn open<P: AsRef<Path>>(path: P) -> DbResult<sled::Db> {
    let db = sled::open(path.as_ref())?;
    log::debug!(
        "opened catalog at {} ({} bytes on disk)",
        path.as_ref().display(),
        db.size_on_disk()?
    );
    Ok(db)
}

pub trait UserDb {
    type Error;
    /// Stores a user under a fresh id. Returns `None` if the email is taken.
    fn add_user(&self, user: NewUser) -> Result<Option<u64>, Self::Error>;
    fn get_user(&self, id: u64) -> Result<Option<User>, Self::Error>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<User>, Self::Error>;
    fn email_exists(&self, email: &str) -> Result<bool, Self::Error>;
    fn load_users(&self) -> Result<Vec<User>, Self::Error>;
    /// Largest assigned user id, 0 if there are no users.
    fn max_user_id(&self) -> Result<u64, Self::Error>;
}

impl UserDb for sled::Db {
    type Error = DbError;

    fn add_user(&self, user: NewUser) -> DbResult<Option<u64>> {
        let users = self.open_tree(USERS)?;
        let users_email = self.open_tree(USERS_EMAIL)?;
        // Ids start at 1 so that 0 can mean "no users".
        let id = self.generate_id()? + 1;
        let key = serialize_id(id);
        let email = user.email.clone();
        let record = bincode::serialize(&User {
            id,
            name: user.name,
            email: user.email,
            password_hash: user.password_hash,
        })?;
        let res = (&users, &users_email).transaction(|(users, users_email)| {
            if users_email.insert(email.as_bytes(), &key[..])?.is_some() {
                return refused();
            }
            users.insert(&key[..], record.as_slice())?;
            Ok(id)
        });
        let id = finish(res)?;
        match id {
            Some(id) => log::debug!("added user {} <{}>", id, email),
            None => log::debug!("email already registered: {}", email),
        }
        Ok(id)
    }

    fn get_user(&self, id: u64) -> DbResult<Option<User>> {
        let users = self.open_tree(USERS)?;
        match users.get(serialize_id(id))? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn get_user_by_email(&self, email: &str) -> DbResult<Option<User>> {
        let users_email = self.open_tree(USERS_EMAIL)?;
        let users = self.open_tree(USERS)?;
        if let Some(id) = users_email.get(email)? {
            let data = users.get(&id)?.ok_or(DbError::BadIndex("users_email"))?;
            Ok(Some(bincode::deserialize(&data)?))
        } else {
            Ok(None)
        }
    }

    fn email_exists(&self, email: &str) -> DbResult<bool> {
        Ok(self.open_tree(USERS_EMAIL)?.contains_key(email)?)
    }

    fn load_users(&self) -> DbResult<Vec<User>> {
        let users = self.open_tree(USERS)?;
        users
            .iter()
            .values()
            .map(|data| -> DbResult<User> { Ok(bincode::deserialize(&data?)?) })
            .collect()
    }

    fn max_user_id(&self) -> DbResult<u64> {
        match self.open_tree(USERS)?.last()? {
            Some((id, _)) => deserialize_id(id),
            None => Ok(0),
        }
    }
}

pub trait MovieDb {
    type Error;
    /// Stores a movie without its comments. Returns `None` if a movie with the
    /// same title, director and year already exists.
    fn add_movie(&self, movie: &Movie) -> Result<Option<u64>, Self::Error>;
    fn get_movie_id(&self, key: &MovieKey) -> Result<Option<u64>, Self::Error>;
    fn get_movie(&self, id: u64) -> Result<Option<Movie>, Self::Error>;
    /// All movies in insertion order. Comments are left empty.
    fn load_movies(&self) -> Result<Vec<(u64, Movie)>, Self::Error>;
    /// Removes the movie and all of its reviews. Returns whether it existed.
    fn delete_movie(&self, key: &MovieKey) -> Result<bool, Self::Error>;
    /// Rewrites the ratings. Values are stored as given.
    fn update_movie_ratings(&self, key: &MovieKey, ratings: &[i32]) -> Result<bool, Self::Error>;
    fn set_favorite(&self, key: &MovieKey, favorite: bool) -> Result<bool, Self::Error>;
}

/// Reads the movie addressed by `key`, applies `change` and writes the whole
/// record back. Returns the new record, or `None` if there is no such movie.
fn rewrite_movie<F>(db: &sled::Db, key: &MovieKey, change: F) -> DbResult<Option<Movie>>
where
    F: Fn(&mut Movie),
{
    let movies_key = db.open_tree(MOVIES_KEY)?;
    let movies = db.open_tree(MOVIES)?;
    let index_key = movie_key_bytes(key)?;
    let res = (&movies_key, &movies).transaction(|(movies_key, movies)| {
        let id = match movies_key.get(&index_key)? {
            Some(id) => id,
            None => return refused(),
        };
        let data = movies
            .get(&id)?
            .ok_or_else(|| failed(DbError::BadIndex("movies_key")))?;
        let mut movie: Movie = bincode::deserialize(&data).map_err(failed)?;
        change(&mut movie);
        let data = bincode::serialize(&movie).map_err(failed)?;
        movies.insert(id, data)?;
        Ok(movie)
    });
    finish(res)
}

impl MovieDb for sled::Db {
    type Error = DbError;

    fn add_movie(&self, movie: &Movie) -> DbResult<Option<u64>> {
        let movies = self.open_tree(MOVIES)?;
        let movies_key = self.open_tree(MOVIES_KEY)?;
        let id = self.generate_id()? + 1;
        let key = serialize_id(id);
        let index_key = movie_key_bytes(&movie.key())?;
        let record = bincode::serialize(movie)?;
        let res = (&movies, &movies_key).transaction(|(movies, movies_key)| {
            if movies_key.insert(index_key.as_slice(), &key[..])?.is_some() {
                return refused();
            }
            movies.insert(&key[..], record.as_slice())?;
            Ok(id)
        });
        let id = finish(res)?;
        if id.is_none() {
            log::debug!(
                "movie already exists: {} ({}), {}",
                movie.title,
                movie.year,
                movie.director
            );
        }
        Ok(id)
    }

    fn get_movie_id(&self, key: &MovieKey) -> DbResult<Option<u64>> {
        let movies_key = self.open_tree(MOVIES_KEY)?;
        match movies_key.get(movie_key_bytes(key)?)? {
            Some(id) => Ok(Some(deserialize_id(id)?)),
            None => Ok(None),
        }
    }

    fn get_movie(&self, id: u64) -> DbResult<Option<Movie>> {
        let movies = self.open_tree(MOVIES)?;
        match movies.get(serialize_id(id))? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn load_movies(&self) -> DbResult<Vec<(u64, Movie)>> {
        let movies = self.open_tree(MOVIES)?;
        movies
            .iter()
            .map(|entry| -> DbResult<(u64, Movie)> {
                let (id, data) = entry?;
                Ok((deserialize_id(id)?, bincode::deserialize(&data)?))
            })
            .collect()
    }

    fn delete_movie(&self, key: &MovieKey) -> DbResult<bool> {
        let id = match self.get_movie_id(key)? {
            Some(id) => id,
            None => return Ok(false),
        };
        let movies_key = self.open_tree(MOVIES_KEY)?;
        let movies = self.open_tree(MOVIES)?;
        let reviews = self.open_tree(REVIEWS)?;
        let index_key = movie_key_bytes(key)?;
        let id_bytes = serialize_id(id);
        // Transactions cannot scan, so the keys are collected up front. A
        // review committed in between stays behind under the dead movie id,
        // unreachable since ids are never reused.
        let review_keys = reviews
            .scan_prefix(id_bytes)
            .keys()
            .collect::<sled::Result<Vec<_>>>()?;
        let res = (&movies_key, &movies, &reviews).transaction(|(movies_key, movies, reviews)| {
            match movies_key.remove(index_key.as_slice())? {
                Some(indexed) if &*indexed == &id_bytes[..] => {}
                // Deleted or replaced since the lookup.
                _ => return refused(),
            }
            movies.remove(&id_bytes[..])?;
            for review in &review_keys {
                reviews.remove(review.clone())?;
            }
            Ok(())
        });
        let deleted = finish(res)?.is_some();
        if deleted {
            log::debug!("deleted movie {} and {} reviews", id, review_keys.len());
        }
        Ok(deleted)
    }

    fn update_movie_ratings(&self, key: &MovieKey, ratings: &[i32]) -> DbResult<bool> {
        Ok(rewrite_movie(self, key, |movie| movie.ratings = ratings.to_vec())?.is_some())
    }

    fn set_favorite(&self, key: &MovieKey, favorite: bool) -> DbResult<bool> {
        Ok(rewrite_movie(self, key, |movie| movie.favorite = favorite)?.is_some())
    }
}

pub trait ReviewDb {
    type Error;
    /// Returns `None` if the movie does not exist.
    fn add_review(
        &self,
        key: &MovieKey,
        user_id: u64,
        comment: &str,
    ) -> Result<Option<u64>, Self::Error>;
    /// Comments formatted as `"name: comment"`, newest first.
    fn load_reviews(&self, key: &MovieKey) -> Result<Vec<String>, Self::Error>;
}

impl ReviewDb for sled::Db {
    type Error = DbError;

    fn add_review(&self, key: &MovieKey, user_id: u64, comment: &str) -> DbResult<Option<u64>> {
        let movie_id = match self.get_movie_id(key)? {
            Some(id) => id,
            None => return Ok(None),
        };
        let movies = self.open_tree(MOVIES)?;
        let reviews = self.open_tree(REVIEWS)?;
        let review_id = self.generate_id()? + 1;
        let movie_key = serialize_id(movie_id);
        let key = review_key(movie_id, review_id);
        let record = bincode::serialize(&Review {
            movie_id,
            user_id,
            comment: comment.to_owned(),
        })?;
        let res = (&movies, &reviews).transaction(|(movies, reviews)| {
            if movies.get(&movie_key[..])?.is_none() {
                return refused();
            }
            reviews.insert(key.as_slice(), record.as_slice())?;
            Ok(review_id)
        });
        finish(res)
    }

    fn load_reviews(&self, key: &MovieKey) -> DbResult<Vec<String>> {
        let movie_id = match self.get_movie_id(key)? {
            Some(id) => id,
            None => return Ok(Vec::new()),
        };
        let reviews = self.open_tree(REVIEWS)?;
        let mut comments = Vec::new();
        for data in reviews.scan_prefix(serialize_id(movie_id)).values().rev() {
            let review: Review = bincode::deserialize(&data?)?;
            match self.get_user(review.user_id)? {
                Some(user) => comments.push(format!("{}: {}", user.name, review.comment)),
                None => log::debug!("skipping review by unknown user {}", review.user_id),
            }
        }
        Ok(comments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temporary() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    fn new_user(name: &str, email: &str) -> NewUser {
        NewUser {
            name: name.to_owned(),
            email: email.to_owned(),
            password_hash: String::new(),
        }
    }

    fn dune() -> Movie {
        Movie::new("Dune", "Villeneuve", 2021, vec!["sci-fi".to_owned()])
    }

    #[test]
    fn users() {
        let db = temporary();
        assert_eq!(db.max_user_id().unwrap(), 0);
        let alice = db.add_user(new_user("Alice", "alice@example.com")).unwrap().unwrap();
        let bob = db.add_user(new_user("Bob", "bob@example.com")).unwrap().unwrap();
        assert!(bob > alice);
        assert_eq!(db.max_user_id().unwrap(), bob);

        let user = db.get_user_by_email("alice@example.com").unwrap().unwrap();
        assert_eq!(user.id, alice);
        assert_eq!(user.name, "Alice");
        assert_eq!(db.get_user(bob).unwrap().unwrap().email, "bob@example.com");
        assert!(db.get_user_by_email("carol@example.com").unwrap().is_none());

        assert!(db.email_exists("bob@example.com").unwrap());
        assert!(!db.email_exists("carol@example.com").unwrap());

        let names: Vec<_> = db.load_users().unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn email_is_unique() {
        let db = temporary();
        db.add_user(new_user("Alice", "alice@example.com")).unwrap().unwrap();
        assert_eq!(db.add_user(new_user("Impostor", "alice@example.com")).unwrap(), None);
        assert_eq!(db.load_users().unwrap().len(), 1);
        assert_eq!(
            db.get_user_by_email("alice@example.com").unwrap().unwrap().name,
            "Alice"
        );
        assert!(!db.email_exists("impostor@example.com").unwrap());
    }

    #[test]
    fn movies() {
        let db = temporary();
        let mut inception = Movie::new("Inception", "Nolan", 2010, vec!["thriller".to_owned()]);
        inception.ratings = vec![5, 4];
        let dune_id = db.add_movie(&dune()).unwrap().unwrap();
        let inception_id = db.add_movie(&inception).unwrap().unwrap();

        assert_eq!(db.get_movie_id(&dune().key()).unwrap(), Some(dune_id));
        assert_eq!(db.get_movie(inception_id).unwrap(), Some(inception.clone()));

        let loaded = db.load_movies().unwrap();
        assert_eq!(loaded, vec![(dune_id, dune()), (inception_id, inception)]);
    }

    #[test]
    fn natural_key_is_unique() {
        let db = temporary();
        db.add_movie(&dune()).unwrap().unwrap();
        let mut again = dune();
        again.tags = vec!["remake".to_owned()];
        assert_eq!(db.add_movie(&again).unwrap(), None);

        let mut other_year = dune();
        other_year.year = 1984;
        assert!(db.add_movie(&other_year).unwrap().is_some());
        assert_eq!(db.load_movies().unwrap().len(), 2);
    }

    #[test]
    fn ratings_and_favorite() {
        let db = temporary();
        let key = dune().key();
        db.add_movie(&dune()).unwrap().unwrap();

        assert!(db.update_movie_ratings(&key, &[3, 4]).unwrap());
        // Not validated here.
        assert!(db.update_movie_ratings(&key, &[3, 4, 5, 9]).unwrap());

        assert!(db.set_favorite(&key, true).unwrap());
        let id = db.get_movie_id(&key).unwrap().unwrap();
        assert!(db.get_movie(id).unwrap().unwrap().favorite);
        assert!(db.set_favorite(&key, false).unwrap());

        let stored = db.get_movie(id).unwrap().unwrap();
        assert_eq!(stored.ratings, vec![3, 4, 5, 9]);
        assert!(!stored.favorite);
        assert_eq!(stored.tags, dune().tags);

        let mut missing = key.clone();
        missing.year = 1984;
        assert!(!db.update_movie_ratings(&missing, &[1]).unwrap());
        assert!(!db.set_favorite(&missing, true).unwrap());
    }

    #[test]
    fn reviews_newest_first() {
        let db = temporary();
        let key = dune().key();
        db.add_movie(&dune()).unwrap().unwrap();
        let alice = db.add_user(new_user("Alice", "alice@example.com")).unwrap().unwrap();
        let bob = db.add_user(new_user("Bob", "bob@example.com")).unwrap().unwrap();

        db.add_review(&key, alice, "Great movie!").unwrap().unwrap();
        db.add_review(&key, bob, "Too long").unwrap().unwrap();

        assert_eq!(
            db.load_reviews(&key).unwrap(),
            vec!["Bob: Too long".to_owned(), "Alice: Great movie!".to_owned()]
        );
    }

    #[test]
    fn reviews_of_unknown_users_are_skipped() {
        let db = temporary();
        let key = dune().key();
        db.add_movie(&dune()).unwrap().unwrap();
        let alice = db.add_user(new_user("Alice", "alice@example.com")).unwrap().unwrap();

        assert!(db.add_review(&key, 999, "who am I").unwrap().is_some());
        assert!(db.load_reviews(&key).unwrap().is_empty());

        db.add_review(&key, alice, "sand").unwrap().unwrap();
        assert_eq!(db.load_reviews(&key).unwrap(), vec!["Alice: sand"]);
    }

    #[test]
    fn reviews_of_missing_movie() {
        let db = temporary();
        let alice = db.add_user(new_user("Alice", "alice@example.com")).unwrap().unwrap();
        assert_eq!(db.add_review(&dune().key(), alice, "hello").unwrap(), None);
        assert!(db.load_reviews(&dune().key()).unwrap().is_empty());
    }

    #[test]
    fn reviews_are_per_movie() {
        let db = temporary();
        let inception = Movie::new("Inception", "Nolan", 2010, vec![]);
        db.add_movie(&dune()).unwrap().unwrap();
        db.add_movie(&inception).unwrap().unwrap();
        let alice = db.add_user(new_user("Alice", "alice@example.com")).unwrap().unwrap();
        db.add_review(&dune().key(), alice, "sand").unwrap().unwrap();
        db.add_review(&inception.key(), alice, "dreams").unwrap().unwrap();

        assert_eq!(db.load_reviews(&dune().key()).unwrap(), vec!["Alice: sand"]);
        assert_eq!(db.load_reviews(&inception.key()).unwrap(), vec!["Alice: dreams"]);
    }

    #[test]
    fn delete_removes_reviews() {
        let db = temporary();
        let key = dune().key();
        let inception = Movie::new("Inception", "Nolan", 2010, vec![]);
        db.add_movie(&inception).unwrap().unwrap();
        let alice = db.add_user(new_user("Alice", "alice@example.com")).unwrap().unwrap();
        db.add_review(&inception.key(), alice, "dreams").unwrap().unwrap();

        db.add_movie(&dune()).unwrap().unwrap();
        db.add_review(&key, alice, "sand").unwrap().unwrap();
        db.add_review(&key, alice, "worms").unwrap().unwrap();

        assert!(db.delete_movie(&key).unwrap());
        assert!(!db.delete_movie(&key).unwrap());
        assert_eq!(db.get_movie_id(&key).unwrap(), None);
        assert_eq!(db.open_tree(REVIEWS).unwrap().len(), 1);
        assert_eq!(db.load_reviews(&inception.key()).unwrap(), vec!["Alice: dreams"]);

        // Re-adding under the same key starts without the old reviews.
        db.add_movie(&dune()).unwrap().unwrap();
        assert!(db.load_reviews(&key).unwrap().is_empty());
    }

    #[test]
    fn ids_round_trip() {
        assert_eq!(deserialize_id(serialize_id(258)).unwrap(), 258);
        assert!(matches!(deserialize_id(&[1u8, 2, 3][..]), Err(DbError::BadId(3))));
    }
}
