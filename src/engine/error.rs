use ulid::Ulid;

/// A request that can never succeed as submitted. Displays as the corrective
/// message shown to the speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MalformedTime(String),
    NotOnTheHour(String),
    OutsideWorkingHours { start_hour: u32, last_start_hour: u32, latest_end_hour: u32 },
    BadDuration(u8),
    DateInPast,
    BeyondHorizon(u32),
    BadSetting(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MalformedTime(t) => {
                write!(f, "Неверный формат времени «{t}». Используйте формат ЧЧ:ММ, например 14:00.")
            }
            ValidationError::NotOnTheHour(t) => write!(
                f,
                "Бронирование возможно только на точное время (например, 14:00), получено {t}."
            ),
            ValidationError::OutsideWorkingHours {
                start_hour,
                last_start_hour,
                latest_end_hour,
            } => write!(
                f,
                "Бронирование доступно только с {start_hour:02}:00 до {latest_end_hour:02}:00 \
                 (начало не позже {last_start_hour:02}:00)."
            ),
            ValidationError::BadDuration(d) => {
                write!(f, "Продолжительность может быть только 1 или 2 часа, получено {d}.")
            }
            ValidationError::DateInPast => write!(f, "Дата и время должны быть в будущем."),
            ValidationError::BeyondHorizon(days) => {
                write!(f, "Дата не может быть более чем через {days} дней.")
            }
            ValidationError::BadSetting(msg) => write!(f, "invalid setting: {msg}"),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The requested interval overlaps the given booking.
    Conflict(Ulid),
    /// The booking exists but belongs to someone else.
    NotOwner(Ulid),
    Invalid(ValidationError),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::NotOwner(id) => write!(f, "booking {id} belongs to another user"),
            EngineError::Invalid(e) => write!(f, "{e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Invalid(e)
    }
}
