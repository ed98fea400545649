//! 应用层：实时事件分发核心。
//!
//! 跟踪在线连接、维护每个聊天的在线成员，并把领域事件尽力投递到
//! 每个在线成员的连接队列；通过事件总线在多个服务实例之间同步聊天房间。

pub mod bridge;
pub mod bus;
pub mod channel;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod local_bus;
pub mod membership;
pub mod presence;
pub mod reconcile;
pub mod room;

pub use bridge::{
    chat_events_subject, chat_messages_subject, user_events_subject, BusEnvelope, TransportBridge,
};
pub use bus::{BusError, BusHandler, MessageBus, SubscriptionHandle};
pub use channel::{
    connection_channel, ChannelReceiver, ConnectionChannel, ConnectionId, DropReason, SendOutcome,
};
pub use error::RealtimeError;
pub use fanout::{DeliveryReport, FanoutEngine};
pub use hub::{HubStats, RealtimeHub};
pub use local_bus::LocalMessageBus;
pub use membership::{ChatMembershipProvider, InMemoryMembershipProvider};
pub use presence::{PresenceRegistry, Unregistration};
pub use reconcile::{MembershipReconciler, ReconcileReport};
pub use room::{ChatRoom, RoomBinder};
