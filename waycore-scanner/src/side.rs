//! The two sides a header can be generated for.

/// Side to generate a header for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Side {
    /// Code for client applications
    Client,
    /// Code for servers
    Server,
}

impl Side {
    /// Direction annotation for requests on this side.
    pub fn requests_direction(self) -> &'static str {
        match self {
            Side::Client => "outgoing",
            Side::Server => "incoming",
        }
    }

    /// Direction annotation for events on this side.
    pub fn events_direction(self) -> &'static str {
        match self {
            Side::Client => "incoming",
            Side::Server => "outgoing",
        }
    }
}
