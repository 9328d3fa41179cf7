//! Task entity: request schemas, routine parameter builders and the typed
//! record decoded from routine rows.

use serde::{Serialize, Serializer};
use taskline_contracts::{Params, Permission, PermissionRequirement, Record, Scalar, Table};
use taskline_policy::{Field, Gate, Schema, Validated};
use taskline_routines::{BindError, RoutineName, Shaped};
use time::{Date, OffsetDateTime};

use crate::command::{Command, CommandError};

pub const SECURABLE: &str = "TASK";

pub const OVERVIEW_PENDING: &str = "pending";
pub const OVERVIEW_COMPLETED: &str = "completed";

/// Nullable attributes shared by create and update, in routine order.
fn detail_fields() -> Vec<Field> {
    vec![
        Field::text("description", 0, 1000).nullable(),
        Field::date("dueDate").nullable(),
        Field::text("recurrence", 0, 1000).nullable(),
        Field::text("attachments", 0, 1000).nullable(),
        Field::text("tags", 0, 1000).nullable(),
        Field::int("estimatedTime", 5, 1440).nullable(),
        Field::text("assignedUsers", 0, 1000).nullable(),
    ]
}

pub fn create_schema() -> Schema {
    let mut fields = vec![
        Field::text("title", 3, 100),
        Field::int("priority", 0, 2).default(1_i64),
    ];
    fields.extend(detail_fields());
    Schema::new(fields)
}

pub fn list_schema() -> Schema {
    Schema::new(vec![
        Field::bit("completed").optional(),
        Field::int("priority", 0, 2).optional(),
        Field::date("dueDateFrom").optional(),
        Field::date("dueDateTo").optional(),
    ])
}

pub fn id_schema() -> Schema {
    Schema::new(vec![Field::id("id")])
}

pub fn update_schema() -> Schema {
    let mut fields = vec![
        Field::id("id"),
        Field::text("title", 3, 100),
        Field::int("priority", 0, 2),
        Field::bit("completed"),
    ];
    fields.extend(detail_fields());
    Schema::new(fields)
}

fn with_details(mut params: Params, validated: &Validated) -> Params {
    for name in [
        "description",
        "dueDate",
        "recurrence",
        "attachments",
        "tags",
        "estimatedTime",
        "assignedUsers",
    ] {
        let value = match validated.params.value(name) {
            Scalar::Text(text) if text.is_empty() => Scalar::Null,
            value => value,
        };
        params.set(name, value);
    }
    params
}

fn create_params(validated: &Validated) -> Params {
    let params = Params::new()
        .with("idAccount", validated.credential.account_id)
        .with("idUser", validated.credential.user_id)
        .with("title", validated.params.value("title"))
        .with("priority", validated.params.value("priority"));
    with_details(params, validated)
}

fn list_params(validated: &Validated) -> Params {
    Params::new()
        .with("idAccount", validated.credential.account_id)
        .with("idUser", validated.credential.user_id)
        .with("completed", validated.params.value("completed"))
        .with("priority", validated.params.value("priority"))
        .with("dueDateFrom", validated.params.value("dueDateFrom"))
        .with("dueDateTo", validated.params.value("dueDateTo"))
}

fn by_id_params(validated: &Validated) -> Params {
    Params::new()
        .with("idAccount", validated.credential.account_id)
        .with("idTask", validated.params.value("id"))
}

fn update_params(validated: &Validated) -> Params {
    let params = by_id_params(validated)
        .with("title", validated.params.value("title"))
        .with("priority", validated.params.value("priority"))
        .with("completed", validated.params.value("completed"));
    with_details(params, validated)
}

fn overview_params(validated: &Validated) -> Params {
    Params::new()
        .with("idAccount", validated.credential.account_id)
        .with("idUser", validated.credential.user_id)
}

fn gate(permission: Permission) -> Gate {
    Gate::new(vec![PermissionRequirement::new(SECURABLE, permission)])
}

/// Every task command, declared once at startup.
#[derive(Debug, Clone)]
pub struct TaskCommands {
    pub create: Command,
    pub list: Command,
    pub get: Command,
    pub update: Command,
    pub delete: Command,
    pub overview: Command,
}

impl TaskCommands {
    pub fn new() -> Result<Self, BindError> {
        let routine = |name: &str| RoutineName::parse(&format!("functional.{}", name));

        Ok(Self {
            create: Command::new(
                "task.create",
                gate(Permission::Create),
                create_schema(),
                routine("spTaskCreate")?,
                create_params,
            ),
            list: Command::new(
                "task.list",
                gate(Permission::List),
                list_schema(),
                routine("spTaskList")?,
                list_params,
            ),
            get: Command::new(
                "task.get",
                gate(Permission::Read),
                id_schema(),
                routine("spTaskGet")?,
                by_id_params,
            ),
            update: Command::new(
                "task.update",
                gate(Permission::Update),
                update_schema(),
                routine("spTaskUpdate")?,
                update_params,
            ),
            delete: Command::new(
                "task.delete",
                gate(Permission::Delete),
                id_schema(),
                routine("spTaskDelete")?,
                by_id_params,
            ),
            overview: Command::new(
                "task.overview",
                gate(Permission::List),
                Schema::default(),
                routine("spTaskOverview")?,
                overview_params,
            )
            .with_result_sets(&[OVERVIEW_PENDING, OVERVIEW_COMPLETED])
            .transactional(),
        })
    }
}

fn ser_date<S: Serializer>(value: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error> {
    Scalar::from(*value).serialize(serializer)
}

fn ser_timestamp<S: Serializer>(
    value: &Option<OffsetDateTime>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    value.map(Scalar::Timestamp).unwrap_or(Scalar::Null).serialize(serializer)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id_task: i64,
    pub title: String,
    pub description: Option<String>,
    #[serde(serialize_with = "ser_date")]
    pub due_date: Option<Date>,
    pub priority: i64,
    pub recurrence: Option<String>,
    pub attachments: Option<String>,
    pub tags: Option<String>,
    pub estimated_time: Option<i64>,
    pub assigned_users: Option<String>,
    pub completed: bool,
    #[serde(serialize_with = "ser_timestamp")]
    pub date_created: Option<OffsetDateTime>,
    #[serde(serialize_with = "ser_timestamp")]
    pub date_modified: Option<OffsetDateTime>,
}

impl TaskRecord {
    pub fn from_record(record: &Record) -> Result<Self, CommandError> {
        let text = |name: &str| record.get(name).and_then(Scalar::as_str).map(str::to_string);
        let int = |name: &str| record.get(name).and_then(Scalar::as_i64);
        let timestamp = |name: &str| match record.get(name) {
            Some(Scalar::Timestamp(ts)) => Some(*ts),
            _ => None,
        };
        let missing = |name: &str| CommandError::Internal(format!("task row is missing {}", name));

        Ok(Self {
            id_task: int("idTask").ok_or_else(|| missing("idTask"))?,
            title: text("title").ok_or_else(|| missing("title"))?,
            description: text("description"),
            due_date: record.get("dueDate").and_then(Scalar::as_date),
            priority: int("priority").ok_or_else(|| missing("priority"))?,
            recurrence: text("recurrence"),
            attachments: text("attachments"),
            tags: text("tags"),
            estimated_time: int("estimatedTime"),
            assigned_users: text("assignedUsers"),
            completed: record
                .get("completed")
                .and_then(Scalar::as_bool)
                .ok_or_else(|| missing("completed"))?,
            date_created: timestamp("dateCreated"),
            date_modified: timestamp("dateModified"),
        })
    }

    pub fn from_table(rows: &Table) -> Result<Vec<Self>, CommandError> {
        rows.iter().map(Self::from_record).collect()
    }

    pub fn from_shaped(shaped: &Shaped) -> Result<Self, CommandError> {
        let row = shaped
            .first_row()
            .ok_or_else(|| CommandError::Internal("routine returned no task row".to_string()))?;
        Self::from_record(row)
    }
}

fn first_int(shaped: &Shaped, column: &str) -> Result<i64, CommandError> {
    shaped
        .first_row()
        .and_then(|row| row.get(column))
        .and_then(Scalar::as_i64)
        .ok_or_else(|| CommandError::Internal(format!("routine result is missing {}", column)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreated {
    pub id_task: i64,
}

impl TaskCreated {
    pub fn from_shaped(shaped: &Shaped) -> Result<Self, CommandError> {
        Ok(Self {
            id_task: first_int(shaped, "idTask")?,
        })
    }
}

/// Update and delete report how many task rows they touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskChanged {
    pub rows_affected: i64,
}

impl TaskChanged {
    pub fn from_shaped(shaped: &Shaped) -> Result<Self, CommandError> {
        Ok(Self {
            rows_affected: first_int(shaped, "rowsAffected")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOverview {
    pub pending: Vec<TaskRecord>,
    pub completed: Vec<TaskRecord>,
}

impl TaskOverview {
    pub fn from_shaped(shaped: &Shaped) -> Result<Self, CommandError> {
        let table = |name: &str| {
            shaped
                .table(name)
                .map(TaskRecord::from_table)
                .unwrap_or_else(|| Ok(Vec::new()))
        };
        Ok(Self {
            pending: table(OVERVIEW_PENDING)?,
            completed: table(OVERVIEW_COMPLETED)?,
        })
    }
}
