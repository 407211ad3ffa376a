//! Self-contained example: a live list of chat rooms backed by the in-memory
//! store.
//!
//! A room registers with its first message and stays registered. Every
//! change to any room prints the full list.
//!
//! Run with: `cargo run --example chat_rooms`

use std::time::Duration;

use eventfold_registry::{
    EntityKey, EntitySpec, EventTypes, Identifier, MemoryStore, ObservationSource, Registration,
    Tags, TypedEvent, observe_all, subscribe,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chat room entity
// ---------------------------------------------------------------------------

/// State of one chat room.
#[derive(Debug, Clone, Default)]
struct ChatRoom {
    name: String,
    users: Vec<String>,
    messages: Vec<String>,
}

/// Domain events of the chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ChatEvent {
    ChatJoined { chat_room: String, username: String },
    ChatMessage { chat_room: String, username: String, message: String },
}

impl ChatEvent {
    fn room(&self) -> &str {
        match self {
            ChatEvent::ChatJoined { chat_room, .. } | ChatEvent::ChatMessage { chat_room, .. } => {
                chat_room
            }
        }
    }
}

impl TypedEvent for ChatEvent {
    fn event_type(&self) -> &str {
        match self {
            ChatEvent::ChatJoined { .. } => "chatJoined",
            ChatEvent::ChatMessage { .. } => "chatMessage",
        }
    }
}

fn chat_tag() -> Tags {
    Tags::new("chat")
}

fn chat_join_tag() -> Tags {
    Tags::new("chat.join")
}

fn chat_room(name: &Identifier) -> EntitySpec<ChatRoom, ChatEvent> {
    EntitySpec::new(
        EntityKey::new("com.example.chatRoom", name.clone(), 0),
        ChatRoom {
            name: name.clone(),
            ..ChatRoom::default()
        },
        chat_tag().with_id(name),
        |mut room: ChatRoom, event: &ChatEvent| {
            match event {
                ChatEvent::ChatJoined { username, .. } => {
                    if !room.users.contains(username) {
                        room.users.push(username.clone());
                    }
                    room.messages.push(format!("{username}: joined"));
                }
                ChatEvent::ChatMessage {
                    username, message, ..
                } => room.messages.push(format!("{username}: {message}")),
            }
            room
        },
    )
}

// ---------------------------------------------------------------------------
// Emitters
// ---------------------------------------------------------------------------

fn join(store: &MemoryStore, room: &str, username: &str) -> Result<(), Box<dyn std::error::Error>> {
    let event = ChatEvent::ChatJoined {
        chat_room: room.to_owned(),
        username: username.to_owned(),
    };
    store.emit(chat_tag().with_id(room).and(chat_join_tag().with_id(room)), &event)?;
    Ok(())
}

fn post(
    store: &MemoryStore,
    room: &str,
    username: &str,
    message: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let event = ChatEvent::ChatMessage {
        chat_room: room.to_owned(),
        username: username.to_owned(),
        message: message.to_owned(),
    };
    store.emit(chat_tag().with_id(room), &event)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryStore::new();

    let rooms: Registration<ChatRoom, ChatEvent> = Registration::new(
        "chat-rooms",
        chat_tag(),
        |event: &ChatEvent| Some(event.room().to_owned()),
        chat_room,
    );

    // Rooms register with their first message, never leave.
    let all_rooms = observe_all(&store, &rooms, "chatMessage", EventTypes::none());
    let handle = subscribe(all_rooms, |rooms: Vec<ChatRoom>| {
        let summary: Vec<String> = rooms
            .iter()
            .map(|room| {
                format!(
                    "{} ({} users, {} messages)",
                    room.name,
                    room.users.len(),
                    room.messages.len()
                )
            })
            .collect();
        println!("rooms: [{}]", summary.join(", "));
    });

    join(&store, "lobby", "alice")?;
    post(&store, "lobby", "alice", "hi all")?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    join(&store, "rust", "bob")?;
    post(&store, "rust", "bob", "borrowck says no")?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    post(&store, "lobby", "alice", "anyone here?")?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.shutdown().await?;
    println!("{} events in the log", store.len());

    Ok(())
}
