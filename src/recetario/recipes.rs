//! Recipe catalogue with optional photos.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::backend::{Backend, BackendError, Filter, Query};
use crate::recetario::error::{OperationOutcome, Result};
use crate::recetario::schema::{RECIPE_IMAGES_BUCKET, RECIPES_TABLE};
use crate::recetario::utils::deserialize_timestamp;

const DEFAULT_IMAGE_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,

    #[serde(rename = "titulo")]
    pub title: String,

    #[serde(rename = "descripcion", default)]
    pub description: String,

    #[serde(rename = "ingredientes", default)]
    pub ingredients: Vec<String>,

    pub chef_id: String,

    #[serde(rename = "imagen_url", default)]
    pub image_url: Option<String>,

    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Photo picked by the user, already read into memory.
#[derive(Clone, PartialEq, Eq)]
pub struct RecipeImage {
    /// Original file name; only its extension is used.
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl RecipeImage {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    pub fn extension(&self) -> String {
        match self.file_name.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() && !ext.contains('/') => ext.to_lowercase(),
            _ => DEFAULT_IMAGE_EXTENSION.to_string(),
        }
    }

    pub fn content_type(&self) -> String {
        format!("image/{}", self.extension())
    }
}

impl std::fmt::Debug for RecipeImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeImage")
            .field("file_name", &self.file_name)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecipe {
    pub title: String,
    pub description: String,
    pub ingredients: Vec<String>,
    pub chef_id: String,
    pub image: Option<RecipeImage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeUpdate {
    pub title: String,
    pub description: String,
    pub ingredients: Vec<String>,
    /// Replacement photo; `None` keeps `previous_image_url`.
    pub image: Option<RecipeImage>,
    pub previous_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecipeOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub recipe: Option<Recipe>,
}

impl From<Result<Recipe>> for RecipeOutcome {
    fn from(result: Result<Recipe>) -> Self {
        match result {
            Ok(recipe) => Self {
                success: true,
                error: None,
                recipe: Some(recipe),
            },
            Err(e) => Self {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}

/// Storage key of a public image URL: its last path segment.
fn image_key(url: &str) -> Option<&str> {
    url.rsplit('/').next().filter(|key| !key.is_empty())
}

fn by_id(id: &str) -> Vec<Filter> {
    vec![Filter::Eq("id".to_string(), json!(id))]
}

fn decode_recipes(rows: Vec<Value>) -> Vec<Recipe> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(recipe) => Some(recipe),
            Err(e) => {
                tracing::warn!(
                    target: "recetario::recipes",
                    "Skipping unreadable recipe row: {}",
                    e
                );
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct RecipesService {
    backend: Arc<dyn Backend>,
}

impl RecipesService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Every recipe, newest first. Failures yield an empty list.
    pub async fn list(&self) -> Vec<Recipe> {
        self.query(Query::new(RECIPES_TABLE).order_by("created_at", false))
            .await
    }

    /// Recipes whose ingredient list contains `ingredient`, newest first.
    pub async fn search_by_ingredient(&self, ingredient: &str) -> Vec<Recipe> {
        self.query(
            Query::new(RECIPES_TABLE)
                .contains("ingredientes", [ingredient])
                .order_by("created_at", false),
        )
        .await
    }

    async fn query(&self, query: Query) -> Vec<Recipe> {
        match self.backend.select(&query).await {
            Ok(rows) => decode_recipes(rows),
            Err(e) => {
                tracing::error!(
                    target: "recetario::recipes",
                    "Failed to load recipes: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    /// Uploads the photo if any, then inserts the recipe.
    ///
    /// A photo that fails to upload leaves the recipe without one.
    pub async fn create(&self, recipe: NewRecipe) -> RecipeOutcome {
        let result = self.try_create(recipe).await;
        if let Err(e) = &result {
            tracing::error!(target: "recetario::recipes", "Failed to create recipe: {}", e);
        }
        result.into()
    }

    async fn try_create(&self, recipe: NewRecipe) -> Result<Recipe> {
        let image_url = match &recipe.image {
            Some(image) => self.upload_image(image).await,
            None => None,
        };
        let row = self
            .backend
            .insert(
                RECIPES_TABLE,
                json!({
                    "titulo": recipe.title,
                    "descripcion": recipe.description,
                    "ingredientes": recipe.ingredients,
                    "chef_id": recipe.chef_id,
                    "imagen_url": image_url,
                }),
            )
            .await?;
        let created: Recipe = serde_json::from_value(row)?;
        tracing::info!(target: "recetario::recipes", "Created recipe {}", created.id);
        Ok(created)
    }

    /// Replaces the editable fields of a recipe.
    ///
    /// With a new photo the previous one is removed first, then the new one uploaded.
    pub async fn update(&self, id: &str, update: RecipeUpdate) -> RecipeOutcome {
        let result = self.try_update(id, update).await;
        if let Err(e) = &result {
            tracing::error!(
                target: "recetario::recipes",
                "Failed to update recipe {}: {}",
                id,
                e
            );
        }
        result.into()
    }

    async fn try_update(&self, id: &str, update: RecipeUpdate) -> Result<Recipe> {
        let image_url = match &update.image {
            Some(image) => {
                if let Some(previous) = &update.previous_image_url {
                    self.remove_image(previous).await;
                }
                self.upload_image(image).await
            }
            None => update.previous_image_url.clone(),
        };
        let rows = self
            .backend
            .update(
                RECIPES_TABLE,
                &by_id(id),
                json!({
                    "titulo": update.title,
                    "descripcion": update.description,
                    "ingredientes": update.ingredients,
                    "imagen_url": image_url,
                }),
            )
            .await?;
        let row = rows.into_iter().next().ok_or(BackendError::NotFound)?;
        Ok(serde_json::from_value(row)?)
    }

    /// Deletes a recipe and its photo.
    pub async fn delete(&self, id: &str) -> OperationOutcome {
        let result = self.try_delete(id).await;
        if let Err(e) = &result {
            tracing::error!(
                target: "recetario::recipes",
                "Failed to delete recipe {}: {}",
                id,
                e
            );
        }
        result.into()
    }

    async fn try_delete(&self, id: &str) -> Result<()> {
        let lookup = Query::new(RECIPES_TABLE)
            .columns(["imagen_url"])
            .eq("id", id)
            .limit(1);
        let image_url = match self.backend.select(&lookup).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("imagen_url"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                tracing::warn!(
                    target: "recetario::recipes",
                    "Could not look up image of recipe {}: {}",
                    id,
                    e
                );
                None
            }
        };
        if let Some(url) = image_url {
            self.remove_image(&url).await;
        }

        let removed = self.backend.delete(RECIPES_TABLE, &by_id(id)).await?;
        if removed.is_empty() {
            return Err(BackendError::NotFound.into());
        }
        Ok(())
    }

    async fn upload_image(&self, image: &RecipeImage) -> Option<String> {
        let path = format!("{}.{}", Utc::now().timestamp_millis(), image.extension());
        match self
            .backend
            .upload(
                RECIPE_IMAGES_BUCKET,
                &path,
                image.bytes.clone(),
                &image.content_type(),
            )
            .await
        {
            Ok(_) => Some(self.backend.public_url(RECIPE_IMAGES_BUCKET, &path)),
            Err(e) => {
                tracing::error!(
                    target: "recetario::recipes",
                    "Failed to upload image: {}",
                    e
                );
                None
            }
        }
    }

    async fn remove_image(&self, url: &str) {
        let Some(key) = image_key(url) else {
            return;
        };
        if let Err(e) = self
            .backend
            .remove(RECIPE_IMAGES_BUCKET, &[key.to_string()])
            .await
        {
            tracing::warn!(
                target: "recetario::recipes",
                "Failed to remove image {}: {}",
                key,
                e
            );
        }
    }
}
