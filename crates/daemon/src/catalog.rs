use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::MoverConfig;
use crate::error::OperationError;

/// A movie record as the catalog reports it. Only the fields the handlers
/// touch are modeled; everything else rides along in `extra` so an update
/// PUT sends the record back complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movie {
    pub id: i64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "rootFolderPath", skip_serializing_if = "Option::is_none")]
    pub root_folder_path: Option<String>,
    #[serde(rename = "hasFile", default)]
    pub has_file: bool,
    #[serde(rename = "movieFile", default, skip_serializing_if = "Option::is_none")]
    pub movie_file: Option<MovieFile>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The movie's media file as the catalog reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A library root folder known to the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFolder {
    pub path: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl From<reqwest::Error> for OperationError {
    fn from(e: reqwest::Error) -> Self {
        OperationError::Catalog(e.to_string())
    }
}

/// Client for the external movie catalog's v3 HTTP API.
///
/// Connectivity failures, authorization failures and non-2xx responses all
/// surface as the catalog error kind; the handlers do not distinguish them.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl CatalogClient {
    pub fn new(host: &str, port: u16, api_key: &str) -> Self {
        CatalogClient {
            base_url: format!("http://{}:{}/api/v3", host, port),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &MoverConfig) -> Self {
        Self::new(&config.catalog_host, config.catalog_port, &config.catalog_api_key)
    }

    /// Get all root folders from the catalog
    pub async fn list_root_folders(&self) -> Result<Vec<RootFolder>, OperationError> {
        let resp = self
            .http
            .get(format!("{}/rootfolder", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Get all movies from the catalog
    pub async fn list_movies(&self) -> Result<Vec<Movie>, OperationError> {
        let resp = self
            .http
            .get(format!("{}/movie", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Get a specific movie by id
    pub async fn get_movie(&self, movie_id: i64) -> Result<Movie, OperationError> {
        let resp = self
            .http
            .get(format!("{}/movie/{}", self.base_url, movie_id))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Update a movie record. The catalog expects the full record, so the
    /// caller passes back a `Movie` obtained from it (with `extra` intact).
    pub async fn update_movie(&self, movie_id: i64, movie: &Movie) -> Result<Movie, OperationError> {
        let resp = self
            .http
            .put(format!("{}/movie/{}", self.base_url, movie_id))
            .header("X-Api-Key", &self.api_key)
            .json(movie)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Trigger a rescan command for a specific movie
    pub async fn trigger_rescan(&self, movie_id: i64) -> Result<(), OperationError> {
        self.http
            .post(format!("{}/command", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .json(&json!({
                "name": "RescanMovie",
                "movieId": movie_id,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Get movies whose path sits under the given root folder and that have
    /// a file on record
    pub async fn filter_by_root_folder(&self, root: &str) -> Result<Vec<Movie>, OperationError> {
        let movies = self.list_movies().await?;
        Ok(movies.into_iter().filter(|m| movie_in_root(m, root)).collect())
    }
}

fn movie_in_root(movie: &Movie, root: &str) -> bool {
    movie.has_file
        && movie
            .path
            .as_deref()
            .map(|p| p.starts_with(root))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_format() {
        let client = CatalogClient::new("radarr.local", 7878, "secret");
        assert_eq!(client.base_url, "http://radarr.local:7878/api/v3");
    }

    #[test]
    fn test_movie_round_trips_unmodeled_fields() {
        let raw = serde_json::json!({
            "id": 42,
            "title": "Heat",
            "path": "/movies_ssd/Heat (1995)",
            "rootFolderPath": "/movies_ssd",
            "hasFile": true,
            "movieFile": {
                "path": "/movies_ssd/Heat (1995)/Heat.mkv",
                "size": 123456u64,
                "quality": {"quality": {"name": "Bluray-1080p"}}
            },
            "tmdbId": 949,
            "monitored": true
        });

        let movie: Movie = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(movie.id, 42);
        assert_eq!(movie.movie_file.as_ref().unwrap().size, Some(123456));

        // Fields the handlers never touch must survive a PUT round trip.
        let back = serde_json::to_value(&movie).unwrap();
        assert_eq!(back["tmdbId"], raw["tmdbId"]);
        assert_eq!(back["monitored"], raw["monitored"]);
        assert_eq!(
            back["movieFile"]["quality"]["quality"]["name"],
            raw["movieFile"]["quality"]["quality"]["name"]
        );
    }

    #[test]
    fn test_movie_in_root_requires_file_and_prefix() {
        let movie: Movie = serde_json::from_value(serde_json::json!({
            "id": 1,
            "title": "Alien",
            "path": "/movies_hdd/Alien (1979)",
            "hasFile": true
        }))
        .unwrap();

        assert!(movie_in_root(&movie, "/movies_hdd"));
        assert!(!movie_in_root(&movie, "/movies_ssd"));

        let fileless: Movie = serde_json::from_value(serde_json::json!({
            "id": 2,
            "title": "Alien 3",
            "path": "/movies_hdd/Alien 3 (1992)",
            "hasFile": false
        }))
        .unwrap();
        assert!(!movie_in_root(&fileless, "/movies_hdd"));
    }
}
