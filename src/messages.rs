use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "register_user")]
    RegisterUser {
        username: String,
    },
    #[serde(rename = "send_message")]
    SendMessage {
        sender: String,
        receiver: String,
        text: String,
    },
    #[serde(rename = "typing")]
    Typing {
        sender: String,
        receiver: String,
    },
    #[serde(rename = "stop_typing")]
    StopTyping {
        sender: String,
        receiver: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "online_users")]
    OnlineUsers {
        users: Vec<String>,
    },
    #[serde(rename = "receive_message")]
    ReceiveMessage {
        sender: String,
        text: String,
        timestamp: i64,
    },
    #[serde(rename = "message_sent")]
    MessageSent {
        receiver: String,
        text: String,
        timestamp: i64,
    },
    #[serde(rename = "user_typing")]
    UserTyping {
        sender: String,
    },
    #[serde(rename = "user_stop_typing")]
    UserStopTyping {
        sender: String,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
    },
}
