//! Collection, column and bucket names of the hosted backend.

pub const MESSAGES_TABLE: &str = "mensajes";
pub const MESSAGES_CHANNEL: &str = "mensajes-channel";
pub const MESSAGE_AUTHOR_FK: &str = "fk_usuario";

pub const TYPING_TABLE: &str = "typing_status";
pub const TYPING_CHANNEL: &str = "typing-status-channel";
pub const TYPING_CONFLICT_COLUMN: &str = "usuario_id";

pub const USERS_TABLE: &str = "usuarios";

pub const RECIPES_TABLE: &str = "recetas";
pub const RECIPE_IMAGES_BUCKET: &str = "recetas-fotos";
