use uuid::Uuid;

use village_health_common::{AppError, Pagination, RedisService, UserRole, UserStatus};
use village_health_database::{create_lazy_pool, run_migrations, User};
use village_health_portal::{
    config::AppConfig,
    models::{AdminProblemForm, EscalateForm, NewProblem, RegisterForm, RespondForm, StatusForm},
    services::{AppState, NotificationService, ProblemService, ReportService, UserService},
};

async fn test_state() -> Option<AppState> {
    // Skip test if no database is available
    let Ok(url) = std::env::var("DATABASE_URL") else {
        println!("Skipping workflow test - DATABASE_URL not set");
        return None;
    };

    let pool = create_lazy_pool(&url).expect("Invalid DATABASE_URL");
    run_migrations(&pool).await.expect("Failed to run migrations");

    let mut config = AppConfig::from_env().expect("Invalid configuration");
    config.storage.uploads_dir = std::env::temp_dir().join("vh-workflow-uploads").display().to_string();
    let redis = RedisService::lazy(&config.redis).expect("Invalid Redis URL");
    Some(AppState::new(pool, redis, config))
}

async fn create_admin(state: &AppState) -> User {
    sqlx::query_as::<_, User>(
        "INSERT INTO users (name, email, password, role, status) VALUES ($1, $2, 'x', 'admin', 'active') RETURNING *",
    )
    .bind("Test Admin")
    .bind(format!("admin-{}@example.org", Uuid::new_v4()))
    .fetch_one(&state.db_pool)
    .await
    .expect("Failed to create admin")
}

/// Inserts an account the way older installs stored it, with a raw status.
async fn legacy_user(state: &AppState, name: &str, role: UserRole, status: Option<&str>) -> User {
    sqlx::query_as::<_, User>(
        "INSERT INTO users (name, email, password, role, status) VALUES ($1, $2, 'x', $3, $4) RETURNING *",
    )
    .bind(name)
    .bind(format!("legacy-{}@example.org", Uuid::new_v4()))
    .bind(role.as_str())
    .bind(status)
    .fetch_one(&state.db_pool)
    .await
    .expect("Failed to create legacy user")
}

/// How many times `user_id` shows up across every page of pending approvals.
/// Rescans when other tests change the pending list mid-walk.
async fn times_pending(state: &AppState, user_id: i64) -> usize {
    let users = UserService::new(state);
    loop {
        let mut seen = 0;
        let mut totals = Vec::new();
        let mut page = 1;
        loop {
            let batch = users
                .pending_approvals(Pagination::new(Some(page), Some(100)).unwrap())
                .await
                .unwrap();
            seen += batch.items.iter().filter(|u| u.id == user_id).count();
            totals.push(batch.total);
            if page >= batch.total_pages {
                break;
            }
            page += 1;
        }
        if totals.windows(2).all(|pair| pair[0] == pair[1]) {
            return seen;
        }
    }
}

fn register_form(name: &str, role: UserRole) -> RegisterForm {
    RegisterForm {
        name: name.to_string(),
        email: format!("{}-{}@example.org", name.to_lowercase().replace(' ', "."), Uuid::new_v4()),
        password: "secret123".to_string(),
        confirm_password: "secret123".to_string(),
        role: role.as_str().to_string(),
        phone: None,
        village: Some("Rampur".to_string()),
    }
}

/// Registers a user and, when the role needs it, approves the account.
async fn active_user(state: &AppState, admin: &User, name: &str, role: UserRole) -> User {
    let users = UserService::new(state);
    let user = users.register_user(&register_form(name, role)).await.expect("Failed to register");
    if user.status() == UserStatus::Active {
        return user;
    }
    users.approve_user(admin.id, user.id).await.expect("Failed to approve")
}

async fn report_problem(state: &AppState, villager: &User, title: &str) -> i64 {
    let input = NewProblem {
        title: title.to_string(),
        description: "High fever and body ache since Monday".to_string(),
        priority: Some("high".to_string()),
        category: Some("Fever".to_string()),
        location: Some("Near the temple".to_string()),
        photo: None,
    };
    ProblemService::new(state)
        .create_problem(villager, input)
        .await
        .expect("Failed to report problem")
        .id
}

#[tokio::test]
async fn test_problem_travels_from_villager_to_doctor() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;

    let asha = active_user(&state, &admin, "Asha", UserRole::Villager).await;
    let ravi = active_user(&state, &admin, "Ravi", UserRole::Avms).await;
    let mehta = active_user(&state, &admin, "Mehta", UserRole::Doctor).await;
    assert_eq!(asha.status(), UserStatus::Active);
    assert_eq!(ravi.status(), UserStatus::Active);

    let problems = ProblemService::new(&state);
    let problem_id = report_problem(&state, &asha, "Fever for three days").await;

    let problem = problems.get_problem(problem_id).await.unwrap();
    assert_eq!(problem.status, "pending");
    assert_eq!(problem.category.as_deref(), Some("fever"));
    assert_eq!(problem.villager_name.as_deref(), Some("Asha"));

    let problem = problems.claim_problem(&ravi, problem_id).await.unwrap();
    assert_eq!(problem.status, "assigned");
    assert_eq!(problem.assigned_to, Some(ravi.id));

    let missing_notes = StatusForm { status: "in_progress".to_string(), notes: "  ".to_string() };
    let err = problems.update_status(&ravi, problem_id, &missing_notes).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let visit = StatusForm {
        status: "in_progress".to_string(),
        notes: "Visited, temperature 102F".to_string(),
    };
    problems.update_status(&ravi, problem_id, &visit).await.unwrap();

    let escalation = EscalateForm {
        doctor_id: mehta.id.to_string(),
        notes: "Fever not responding to paracetamol".to_string(),
    };
    let problem = problems.escalate(&ravi, problem_id, &escalation).await.unwrap();
    assert_eq!(problem.status, "escalated");
    assert_eq!(problem.escalated_to_name.as_deref(), Some("Mehta"));

    // Only the doctor it was escalated to may respond
    let stranger = RespondForm { response: "Rest".to_string(), mark_resolved: None };
    let err = problems.respond(&ravi, problem_id, &stranger).await.unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));

    let advice = RespondForm {
        response: "Start antibiotics, review in 3 days".to_string(),
        mark_resolved: Some("on".to_string()),
    };
    let problem = problems.respond(&mehta, problem_id, &advice).await.unwrap();
    assert_eq!(problem.status, "resolved");
    assert!(problem.resolved_at.is_some());

    let detail = problems.problem_detail(&asha, UserRole::Villager, problem_id).await.unwrap();
    let history: Vec<&str> = detail.updates.iter().map(|u| u.new_status.as_str()).collect();
    assert_eq!(history, vec!["assigned", "in_progress", "escalated", "resolved"]);
    assert_eq!(detail.responses.len(), 1);

    let notifications = NotificationService::new(&state);
    let inbox = notifications
        .list_for_user(asha.id, Pagination::new(Some(1), Some(20)).unwrap())
        .await
        .unwrap();
    assert!(inbox.total >= 4, "villager should hear about every step");
    assert!(notifications.unread_count(mehta.id).await.unwrap() >= 1);
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;

    let villager = active_user(&state, &admin, "Sunita", UserRole::Villager).await;
    let first = active_user(&state, &admin, "Officer One", UserRole::Avms).await;
    let second = active_user(&state, &admin, "Officer Two", UserRole::Avms).await;
    let problem_id = report_problem(&state, &villager, "Child with diarrhoea").await;

    let a = ProblemService::new(&state);
    let b = ProblemService::new(&state);
    let (left, right) = tokio::join!(a.claim_problem(&first, problem_id), b.claim_problem(&second, problem_id));

    let outcomes = [left, right];
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, AppError::Conflict(msg) if msg == "Problem is already assigned"));

    let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM problem_updates WHERE problem_id = $1")
        .bind(problem_id)
        .fetch_one(&state.db_pool)
        .await
        .unwrap();
    assert_eq!(history, 1);
}

#[tokio::test]
async fn test_claiming_a_missing_problem_is_not_found() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;
    let officer = active_user(&state, &admin, "Officer Three", UserRole::Avms).await;

    let err = ProblemService::new(&state).claim_problem(&officer, i64::MAX).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_approval_outcomes() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;
    let users = UserService::new(&state);

    let approved = users.register_user(&register_form("Dr Approved", UserRole::Doctor)).await.unwrap();
    let retained = users.register_user(&register_form("Dr Retained", UserRole::Doctor)).await.unwrap();
    let purged = users.register_user(&register_form("Dr Purged", UserRole::Doctor)).await.unwrap();
    for user in [&approved, &retained, &purged] {
        assert_eq!(user.status(), UserStatus::Pending);
    }

    let user = users.approve_user(admin.id, approved.id).await.unwrap();
    assert_eq!(user.status(), UserStatus::Active);

    let user = users.reject_and_retain(admin.id, retained.id).await.unwrap();
    assert_eq!(user.status(), UserStatus::Rejected);
    assert!(users.find_user(retained.id).await.unwrap().is_some());

    users.reject_and_purge(admin.id, purged.id).await.unwrap();
    assert!(users.find_user(purged.id).await.unwrap().is_none());

    // Only pending accounts can be purged
    assert!(users.reject_and_purge(admin.id, approved.id).await.is_err());

    let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM admin_logs WHERE admin_id = $1")
        .bind(admin.id)
        .fetch_one(&state.db_pool)
        .await
        .unwrap();
    assert_eq!(logged, 3);
}

#[tokio::test]
async fn test_every_pending_spelling_is_listed_once_until_decided() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;
    let users = UserService::new(&state);

    let null_status = legacy_user(&state, "Null Status", UserRole::Avms, None).await;
    let empty_status = legacy_user(&state, "Empty Status", UserRole::Doctor, Some("")).await;
    let pending_status = legacy_user(&state, "Pending Status", UserRole::Doctor, Some("pending")).await;
    for user in [&null_status, &empty_status, &pending_status] {
        assert_eq!(times_pending(&state, user.id).await, 1, "{}", user.name);
    }

    users.approve_user(admin.id, null_status.id).await.unwrap();
    users.reject_and_retain(admin.id, empty_status.id).await.unwrap();
    users.reject_and_purge(admin.id, pending_status.id).await.unwrap();

    for user in [&null_status, &empty_status, &pending_status] {
        assert_eq!(times_pending(&state, user.id).await, 0, "{}", user.name);
    }
    let stored = users.find_user(empty_status.id).await.unwrap().unwrap();
    assert_eq!(stored.status(), UserStatus::Rejected);
}

#[tokio::test]
async fn test_purging_an_account_with_problems_asks_for_retain() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;
    let users = UserService::new(&state);

    let villager = legacy_user(&state, "Old Villager", UserRole::Villager, None).await;
    report_problem(&state, &villager, "Stomach pain after meals").await;

    let err = users.reject_and_purge(admin.id, villager.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "{:?}", err);
    assert!(users.find_user(villager.id).await.unwrap().is_some());
    assert_eq!(times_pending(&state, villager.id).await, 1);

    let user = users.reject_and_retain(admin.id, villager.id).await.unwrap();
    assert_eq!(user.status(), UserStatus::Rejected);
    assert_eq!(times_pending(&state, villager.id).await, 0);
}

#[tokio::test]
async fn test_admin_cannot_change_own_account() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;
    let users = UserService::new(&state);

    let err = users.set_status(admin.id, admin.id, UserStatus::Inactive).await.unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));
    assert!(users.change_role(admin.id, admin.id, UserRole::Doctor).await.is_err());
}

#[tokio::test]
async fn test_admin_override_keeps_status_consistent() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;
    let villager = active_user(&state, &admin, "Meena", UserRole::Villager).await;
    let officer = active_user(&state, &admin, "Officer Four", UserRole::Avms).await;
    let problem_id = report_problem(&state, &villager, "Cough with blood").await;
    let problems = ProblemService::new(&state);

    let contradictory = AdminProblemForm {
        status: Some("pending".to_string()),
        priority: None,
        assigned_to: Some(officer.id.to_string()),
        escalated_to: None,
        notes: None,
    };
    let err = problems.admin_update(&admin, problem_id, &contradictory).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidArgument(_)));

    let assign = AdminProblemForm {
        status: None,
        priority: Some("urgent".to_string()),
        assigned_to: Some(officer.id.to_string()),
        escalated_to: None,
        notes: Some("Reassigned by admin".to_string()),
    };
    let problem = problems.admin_update(&admin, problem_id, &assign).await.unwrap();
    assert_eq!(problem.status, "assigned");
    assert_eq!(problem.priority, "urgent");
    assert_eq!(problem.assigned_to, Some(officer.id));

    let unassign = AdminProblemForm {
        status: None,
        priority: None,
        assigned_to: Some("none".to_string()),
        escalated_to: None,
        notes: None,
    };
    let problem = problems.admin_update(&admin, problem_id, &unassign).await.unwrap();
    assert_eq!(problem.status, "pending");
    assert_eq!(problem.assigned_to, None);

    let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM problem_updates WHERE problem_id = $1")
        .bind(problem_id)
        .fetch_one(&state.db_pool)
        .await
        .unwrap();
    assert_eq!(history, 2);
}

#[tokio::test]
async fn test_admin_can_resolve_and_release_problems() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;
    let villager = active_user(&state, &admin, "Lakshmi", UserRole::Villager).await;
    let officer = active_user(&state, &admin, "Officer Five", UserRole::Avms).await;
    let problems = ProblemService::new(&state);

    // clearing the officer of a problem in progress puts it back in the queue
    let released_id = report_problem(&state, &villager, "Swollen ankle").await;
    problems.claim_problem(&officer, released_id).await.unwrap();
    let visit = StatusForm {
        status: "in_progress".to_string(),
        notes: "Visit booked".to_string(),
    };
    problems.update_status(&officer, released_id, &visit).await.unwrap();
    let release = AdminProblemForm {
        status: None,
        priority: None,
        assigned_to: Some("none".to_string()),
        escalated_to: None,
        notes: None,
    };
    let problem = problems.admin_update(&admin, released_id, &release).await.unwrap();
    assert_eq!(problem.status, "pending");
    assert_eq!(problem.assigned_to, None);

    let resolved_id = report_problem(&state, &villager, "Headache for a week").await;
    problems.claim_problem(&officer, resolved_id).await.unwrap();
    let resolve = AdminProblemForm {
        status: Some("resolved".to_string()),
        priority: None,
        assigned_to: None,
        escalated_to: None,
        notes: Some("Closed after phone follow-up".to_string()),
    };
    let problem = problems.admin_update(&admin, resolved_id, &resolve).await.unwrap();
    assert_eq!(problem.status, "resolved");
    assert!(problem.resolved_at.is_some());

    let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM problem_updates WHERE problem_id = $1")
        .bind(resolved_id)
        .fetch_one(&state.db_pool)
        .await
        .unwrap();
    assert_eq!(history, 2);
}

#[tokio::test]
async fn test_csv_export_has_one_row_per_problem() {
    let Some(state) = test_state().await else { return };
    let admin = create_admin(&state).await;
    let villager = active_user(&state, &admin, "Kavita", UserRole::Villager).await;
    report_problem(&state, &villager, "Rash, \"itchy\", spreading").await;

    let (body, rows) = ReportService::new(&state).export_csv().await.unwrap();
    assert!(rows >= 1);
    // problems are never deleted, so the table can only have grown since the export
    let total = ProblemService::new(&state).count_all().await.unwrap();
    assert!(total >= rows as i64);

    let mut reader = csv::Reader::from_reader(body.as_slice());
    assert_eq!(reader.headers().unwrap().len(), 13);
    assert_eq!(reader.records().count(), rows);
}
