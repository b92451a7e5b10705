pub mod audit;
pub mod notifications;
pub mod problems;
pub mod reports;
pub mod settings;
pub mod uploads;
pub mod users;

use sqlx::PgPool;

use village_health_auth::JwtService;
use village_health_common::RedisService;

use crate::config::AppConfig;

pub use audit::AuditService;
pub use notifications::NotificationService;
pub use problems::ProblemService;
pub use reports::ReportService;
pub use settings::SettingsService;
pub use uploads::PhotoStorage;
pub use users::UserService;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub redis_service: RedisService,
    pub jwt_service: JwtService,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(db_pool: PgPool, redis_service: RedisService, config: AppConfig) -> Self {
        let jwt_service = JwtService::new(&config.jwt);
        Self {
            db_pool,
            redis_service,
            jwt_service,
            config,
        }
    }
}
