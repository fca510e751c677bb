pub mod chats;
pub mod documents;
pub mod schema;
pub mod users;
