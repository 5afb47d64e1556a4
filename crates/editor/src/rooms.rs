// Clients for the external room and question services.
//
// The gateway asks the room service who may join a room; session
// construction asks the question service for the starter template. Both
// lookups degrade gracefully: an absent room or template is `None`, and
// transport failures surface as errors the caller logs and tolerates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum RoomServiceError {
    #[error("room service request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// A room as reported by the room service.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub room_id: String,
    pub user_ids: Vec<i64>,
    pub question_id: String,
    pub question_lang_slug: String,
}

#[derive(Debug, Deserialize)]
struct RoomInfoResponse {
    #[serde(rename = "userIds", default)]
    user_ids: Vec<i64>,
    #[serde(rename = "questionId")]
    question_id: String,
    #[serde(rename = "questionLangSlug")]
    question_lang_slug: String,
}

#[derive(Debug, Deserialize)]
struct QuestionResponse {
    data: QuestionData,
}

#[derive(Debug, Deserialize)]
struct QuestionData {
    #[serde(default)]
    template: Vec<QuestionTemplate>,
}

#[derive(Debug, Deserialize)]
struct QuestionTemplate {
    #[serde(rename = "langSlug")]
    lang_slug: String,
    code: String,
}

/// Room/question service client.
///
/// `Http` talks to the real services; `Memory` backs tests with canned
/// rooms and templates.
#[derive(Clone)]
pub enum RoomServiceClient {
    Http(HttpRoomService),
    Memory(MemoryRoomService),
}

impl RoomServiceClient {
    pub fn http(
        room_service_api: &str,
        question_service_api: &str,
        timeout: Duration,
    ) -> Result<Self, RoomServiceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::Http(HttpRoomService {
            http,
            room_service_api: room_service_api.trim_end_matches('/').to_string(),
            question_service_api: question_service_api.trim_end_matches('/').to_string(),
        }))
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryRoomService::default())
    }

    /// Resolve a room by id. `None` means the room does not exist (or the
    /// service said so); errors mean the service could not be reached.
    pub async fn get_room(&self, room_id: &str) -> Result<Option<Room>, RoomServiceError> {
        match self {
            Self::Http(service) => service.get_room(room_id).await,
            Self::Memory(service) => Ok(service.rooms.read().await.get(room_id).cloned()),
        }
    }

    /// Fetch the starter template for a question in a given language.
    pub async fn get_question_template(
        &self,
        question_id: &str,
        lang_slug: &str,
    ) -> Result<Option<String>, RoomServiceError> {
        match self {
            Self::Http(service) => service.get_question_template(question_id, lang_slug).await,
            Self::Memory(service) => Ok(service
                .templates
                .read()
                .await
                .get(&(question_id.to_string(), lang_slug.to_string()))
                .cloned()),
        }
    }
}

#[derive(Clone)]
pub struct HttpRoomService {
    http: reqwest::Client,
    room_service_api: String,
    question_service_api: String,
}

impl HttpRoomService {
    async fn get_room(&self, room_id: &str) -> Result<Option<Room>, RoomServiceError> {
        let url = format!("{}/{room_id}/info", self.room_service_api);
        let response = self.http.get(&url).send().await?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let info: RoomInfoResponse = response.json().await?;
        Ok(Some(Room {
            room_id: room_id.to_string(),
            user_ids: info.user_ids,
            question_id: info.question_id,
            question_lang_slug: info.question_lang_slug,
        }))
    }

    async fn get_question_template(
        &self,
        question_id: &str,
        lang_slug: &str,
    ) -> Result<Option<String>, RoomServiceError> {
        let url = format!("{}/questions/{question_id}", self.question_service_api);
        let response = self.http.get(&url).send().await?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let question: QuestionResponse = response.json().await?;
        Ok(question
            .data
            .template
            .into_iter()
            .find(|template| template.lang_slug == lang_slug)
            .map(|template| template.code))
    }
}

/// In-memory stand-in for both services, used by tests.
#[derive(Clone, Default)]
pub struct MemoryRoomService {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    templates: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl RoomServiceClient {
    pub async fn insert_room(&self, room: Room) {
        if let Self::Memory(service) = self {
            service.rooms.write().await.insert(room.room_id.clone(), room);
        }
    }

    pub async fn insert_template(&self, question_id: &str, lang_slug: &str, code: &str) {
        if let Self::Memory(service) = self {
            service
                .templates
                .write()
                .await
                .insert((question_id.to_string(), lang_slug.to_string()), code.to_string());
        }
    }
}
