use std::fmt;

/// Success report of a session command, shown to the user as a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    Connected { broker: String },
    AlreadyConnected,
    Disconnected,
    AlreadyDisconnected,
    WeatherPublished,
    AlertSent,
    SchedulerStarted,
    SchedulerAlreadyRunning,
    SchedulerStopped,
    SchedulerNotRunning,
    CacheRefreshed,
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusMessage::Connected { broker } => write!(f, "Connected to {}", broker),
            StatusMessage::AlreadyConnected => write!(f, "Already connected"),
            StatusMessage::Disconnected => write!(f, "Disconnected successfully"),
            StatusMessage::AlreadyDisconnected => write!(f, "Already disconnected"),
            StatusMessage::WeatherPublished => write!(f, "Data published successfully"),
            StatusMessage::AlertSent => write!(f, "Alert sent successfully"),
            StatusMessage::SchedulerStarted => write!(f, "Automated weather publishing started"),
            StatusMessage::SchedulerAlreadyRunning => {
                write!(f, "Automated weather publishing is already running")
            }
            StatusMessage::SchedulerStopped => write!(f, "Automated weather publishing stopped"),
            StatusMessage::SchedulerNotRunning => {
                write!(f, "Automated weather publishing was not running")
            }
            StatusMessage::CacheRefreshed => write!(f, "Weather cache refreshed successfully"),
        }
    }
}
