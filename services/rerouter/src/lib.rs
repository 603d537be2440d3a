pub mod config;
pub mod proxy;
pub mod routes_file;

pub use proxy::{
    ConfigError, Direction, HostResolver, ListenerStatsSnapshot, NoopObserver, PortValue,
    ProxyController, ProxyError, ProxyOptions, Route, RouteDescriptor, RouteTable, Session,
    SessionEvent, SessionObserver, StartReport, SystemResolver,
};
