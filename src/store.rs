use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single album record. All fields are opaque strings; `id` is the decimal
/// form of the integer key assigned by the store at apply time.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub url: String,
    pub year: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("album id is not a non-negative decimal integer")]
    BadId,
    #[error("no album with the requested id")]
    NotFound,
}

/// In-memory album table. The store is deterministic: two stores fed the
/// same command sequence produce identical contents, including assigned ids.
/// Mutations happen only through the apply path; reads are pure.
#[derive(Debug, Default)]
pub struct AlbumStore {
    albums: BTreeMap<u64, Album>,
    next_id: u64,
}

impl AlbumStore {
    pub fn new() -> Self {
        AlbumStore {
            albums: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Inserts a new album under the next id and returns the created record.
    /// The id counter is read at call time, so the assigned id depends only
    /// on how many adds were applied before this one.
    pub fn add(&mut self, title: &str, artist: &str, url: &str, year: &str) -> Album {
        let id = self.next_id;
        self.next_id += 1;

        let album = Album {
            id: id.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            url: url.to_string(),
            year: year.to_string(),
        };
        self.albums.insert(id, album.clone());
        album
    }

    /// Overwrites the non-empty fields of an existing album. Empty strings
    /// leave the stored value untouched.
    pub fn edit(
        &mut self,
        id: &str,
        title: &str,
        artist: &str,
        url: &str,
        year: &str,
    ) -> Result<Album, StoreError> {
        let key = Self::parse_id(id)?;
        let album = self.albums.get_mut(&key).ok_or(StoreError::NotFound)?;

        if !title.is_empty() {
            album.title = title.to_string();
        }
        if !artist.is_empty() {
            album.artist = artist.to_string();
        }
        if !url.is_empty() {
            album.url = url.to_string();
        }
        if !year.is_empty() {
            album.year = year.to_string();
        }

        Ok(album.clone())
    }

    /// Deletes the mapping for `id`. The id counter is not decremented, so
    /// removed ids are never reused.
    pub fn remove(&mut self, id: &str) -> Result<(), StoreError> {
        let key = Self::parse_id(id)?;
        self.albums.remove(&key).map(|_| ()).ok_or(StoreError::NotFound)
    }

    pub fn get(&self, id: &str) -> Result<Album, StoreError> {
        let key = Self::parse_id(id)?;
        self.albums.get(&key).cloned().ok_or(StoreError::NotFound)
    }

    /// All albums in ascending id order, skipping deleted ids.
    pub fn get_all(&self) -> Vec<Album> {
        self.albums.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.albums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.albums.is_empty()
    }

    fn parse_id(id: &str) -> Result<u64, StoreError> {
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StoreError::BadId);
        }
        id.parse::<u64>().map_err(|_| StoreError::BadId)
    }
}
