pub mod bot;
pub mod dispatcher;
pub mod hub;
pub mod router;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod ws;

pub use bot::BotRuntime;
pub use dispatcher::{CancellationRegistry, Dispatch, MessageDispatcher};
pub use hub::Hub;
pub use server::GatewayServer;
pub use supervisor::{RestartPolicy, RestartSupervisor, SupervisorOutcome};
