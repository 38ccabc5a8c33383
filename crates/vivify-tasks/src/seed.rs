//! Demo board the server starts with.

use serde_json::{Map, Value, json};

use crate::types::{Task, TaskStatus};

struct SeedTask {
    title: &'static str,
    description: &'static str,
    status: TaskStatus,
    subtasks: Value,
    metadata: Value,
}

fn seed_tasks() -> Vec<SeedTask> {
    vec![
        SeedTask {
            title: "Setup CI/CD Pipeline",
            description: "Configure GitHub Actions for automated testing and deployment",
            status: TaskStatus::InProgress,
            subtasks: json!([
                {"id": "sub-1", "title": "Create workflow file", "status": "completed"},
                {"id": "sub-2", "title": "Configure secrets", "status": "pending"}
            ]),
            metadata: json!({"priority": "high", "assignee": "DevOps Team"}),
        },
        SeedTask {
            title: "Configure Monitoring",
            description: "Set up Prometheus and Grafana for infrastructure monitoring",
            status: TaskStatus::InProgress,
            subtasks: json!([
                {"id": "sub-3", "title": "Install Prometheus", "status": "completed"},
                {"id": "sub-4", "title": "Create dashboards", "status": "pending"}
            ]),
            metadata: json!({"priority": "high", "assignee": "SRE Team"}),
        },
        SeedTask {
            title: "Deploy to Production",
            description: "Deploy the application to production environment",
            status: TaskStatus::InProgress,
            subtasks: json!([]),
            metadata: json!({"priority": "critical", "assignee": "DevOps Team"}),
        },
        SeedTask {
            title: "Update Documentation",
            description: "Update API documentation and deployment guides",
            status: TaskStatus::Todo,
            subtasks: json!([]),
            metadata: json!({"priority": "medium", "assignee": "Tech Writer"}),
        },
        SeedTask {
            title: "Security Audit",
            description: "Perform security audit of the infrastructure",
            status: TaskStatus::Todo,
            subtasks: json!([]),
            metadata: json!({"priority": "high", "assignee": "Security Team"}),
        },
        SeedTask {
            title: "Database Migration",
            description: "Migrate database to new schema version",
            status: TaskStatus::Done,
            subtasks: json!([]),
            metadata: json!({"priority": "high", "assignee": "Backend Team"}),
        },
        SeedTask {
            title: "Load Testing",
            description: "Perform load testing on production environment",
            status: TaskStatus::InReview,
            subtasks: json!([]),
            metadata: json!({"priority": "medium", "assignee": "QA Team"}),
        },
    ]
}

/// The demo tasks, numbered `task-1` upward, stamped with `now`.
pub fn demo_tasks(now: &str) -> Vec<Task> {
    seed_tasks()
        .into_iter()
        .enumerate()
        .map(|(i, seed)| Task {
            id: format!("task-{}", i + 1),
            title: seed.title.to_owned(),
            description: seed.description.to_owned(),
            status: seed.status,
            created_at: now.to_owned(),
            updated_at: now.to_owned(),
            subtasks: match seed.subtasks {
                Value::Array(items) => items,
                _ => Vec::new(),
            },
            metadata: match seed.metadata {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        })
        .collect()
}
