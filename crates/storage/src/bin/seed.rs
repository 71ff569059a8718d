use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing_subscriber::EnvFilter;

use campus_core::model::{
    ActionType, LessonId, PointsAward, PointsHistoryEntry, ProgressPatch, StudentId,
    StudentPointsAggregate,
};
use storage::repository::Storage;

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    student_id: Option<StudentId>,
    lessons: u32,
    completed: u32,
    now: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidStudentId { raw: String },
    InvalidLessons { raw: String },
    InvalidCompleted { raw: String },
    InvalidDbUrl { raw: String },
    InvalidNow { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidStudentId { raw } => {
                write!(f, "invalid --student-id value (expected UUID): {raw}")
            }
            ArgsError::InvalidLessons { raw } => write!(f, "invalid --lessons value: {raw}"),
            ArgsError::InvalidCompleted { raw } => write!(f, "invalid --completed value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidNow { raw } => {
                write!(f, "invalid --now value (expected RFC3339): {raw}")
            }
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

impl Args {
    fn parse() -> Result<Self, ArgsError> {
        let mut db_url =
            std::env::var("CAMPUS_DB_URL").unwrap_or_else(|_| "sqlite:dev.sqlite3".into());
        let mut student_id = std::env::var("CAMPUS_STUDENT_ID")
            .ok()
            .and_then(|value| value.parse::<StudentId>().ok());
        let mut lessons = std::env::var("CAMPUS_LESSONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(3);
        let mut completed = std::env::var("CAMPUS_COMPLETED")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(1);
        let mut now: Option<DateTime<Utc>> = None;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = value;
                }
                "--student-id" => {
                    let value = require_value(&mut args, "--student-id")?;
                    let parsed = value
                        .parse::<StudentId>()
                        .map_err(|_| ArgsError::InvalidStudentId { raw: value.clone() })?;
                    student_id = Some(parsed);
                }
                "--lessons" => {
                    let value = require_value(&mut args, "--lessons")?;
                    lessons = value
                        .parse::<u32>()
                        .map_err(|_| ArgsError::InvalidLessons { raw: value.clone() })?;
                }
                "--completed" => {
                    let value = require_value(&mut args, "--completed")?;
                    completed = value
                        .parse::<u32>()
                        .map_err(|_| ArgsError::InvalidCompleted { raw: value.clone() })?;
                }
                "--now" => {
                    let value = require_value(&mut args, "--now")?;
                    let parsed = DateTime::parse_from_rfc3339(&value)
                        .map_err(|_| ArgsError::InvalidNow { raw: value.clone() })?
                        .with_timezone(&Utc);
                    now = Some(parsed);
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            student_id,
            lessons,
            completed,
            now,
        })
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p storage --bin seed -- [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: sqlite:dev.sqlite3)");
    eprintln!("  --student-id <uuid>       Student to seed (default: random)");
    eprintln!("  --lessons <n>             Lessons to create progress for (default: 3)");
    eprintln!("  --completed <n>           How many of those to mark completed (default: 1)");
    eprintln!("  --now <rfc3339>           Fixed current time for deterministic seeding");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags):");
    eprintln!("  CAMPUS_DB_URL, CAMPUS_STUDENT_ID, CAMPUS_LESSONS, CAMPUS_COMPLETED");
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse().map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let storage = Storage::sqlite(&args.db_url).await?;
    let now = args.now.unwrap_or_else(Utc::now);
    let student = args.student_id.unwrap_or_else(StudentId::random);

    let completed = args.completed.min(args.lessons);
    let mut aggregate = StudentPointsAggregate::empty(student);

    for i in 0..args.lessons {
        let lesson = LessonId::random();
        let watched_at = now - Duration::days(i64::from(args.lessons - i));
        let watch_time = 60 * (i + 1);

        let patch = if i < completed {
            ProgressPatch::completion(watch_time)
        } else {
            ProgressPatch::watch_time(watch_time / 2)
        };
        storage
            .progress
            .upsert_progress(lesson, student, &patch, watched_at)
            .await?;

        if i < completed {
            let award = PointsAward::new(student, 10, ActionType::LessonCompleted)?
                .with_description(Some("Lesson completed".into()))
                .with_reference(Some(lesson.to_string()));
            aggregate = aggregate.apply_award(award.points(), watched_at.date_naive());
            let entry = PointsHistoryEntry::from_award(&award, watched_at);
            storage.points.record_award(&aggregate, &entry).await?;
        }
    }

    println!(
        "Seeded {} lessons ({} completed, {} points) for student {} into {}",
        args.lessons,
        completed,
        aggregate.total_points(),
        student,
        args.db_url
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
