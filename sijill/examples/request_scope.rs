//! Request-scoped services on top of shared singletons.
//!
//! Run with `RUST_LOG=sijill=debug cargo run --example request_scope`.

use std::sync::Arc;
use std::time::Duration;

use sijill::logging::init_tracing;
use sijill::prelude::*;

// === Define your traits and types ===

trait Logger: Send + Sync {
    fn log(&self, msg: &str);
}

struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn log(&self, msg: &str) {
        println!("[LOG] {msg}");
    }
}

struct Config {
    database_url: String,
}

struct Database {
    url: String,
    logger: Arc<dyn Logger>,
}

impl Database {
    fn query(&self, sql: &str) -> String {
        self.logger.log(&format!("Executing: {sql}"));
        format!("Results from {}", self.url)
    }
}

/// One per request; holds the request's view of the data.
struct UserRepository {
    db: Arc<Database>,
}

impl UserRepository {
    fn find_user(&self, id: u64) -> String {
        self.db.query(&format!("SELECT * FROM users WHERE id = {id}"))
    }
}

struct UserService {
    repo: Arc<UserRepository>,
    logger: Arc<dyn Logger>,
}

impl UserService {
    fn get_user(&self, id: u64) -> String {
        self.logger.log(&format!("Getting user {id}"));
        self.repo.find_user(id)
    }
}

struct UserViewed {
    id: u64,
}

fn main() -> Result<()> {
    init_tracing("sijill=debug");

    let container = Container::builder()
        .custom_scope("request")
        .definition(
            ComponentDefinition::instance(
                "config",
                Arc::new(Config {
                    database_url: "postgres://localhost/myapp".to_string(),
                }),
            )
            .build(),
        )
        .definition(
            ComponentDefinition::builder("logger", |_| Ok(ConsoleLogger))
                .capability::<dyn Logger, _>(|l| l as Arc<dyn Logger>)
                .build(),
        )
        .definition(
            ComponentDefinition::builder("database", |deps| {
                Ok(Database {
                    url: deps.get::<Config>(0)?.database_url.clone(),
                    logger: deps.get::<dyn Logger>(1)?,
                })
            })
            .depends_on(Requirement::of::<Config>())
            .depends_on(Requirement::of::<dyn Logger>())
            .on_destroy(|db| {
                db.logger.log("Closing database pool");
                Ok(())
            })
            .build(),
        )
        .definition(
            ComponentDefinition::builder("user_repository", |deps| {
                Ok(UserRepository {
                    db: deps.get::<Database>(0)?,
                })
            })
            .in_scope("request")
            .depends_on(Requirement::of::<Database>())
            .build(),
        )
        .definition(
            ComponentDefinition::builder("user_service", |deps| {
                Ok(UserService {
                    repo: deps.get::<UserRepository>(0)?,
                    logger: deps.get::<dyn Logger>(1)?,
                })
            })
            .prototype()
            .depends_on(Requirement::of::<UserRepository>())
            .depends_on(Requirement::of::<dyn Logger>())
            .build(),
        )
        .build()?;

    container.listen::<UserViewed, _>(
        |viewed| {
            println!("[AUDIT] user {} viewed", viewed.id);
            Ok(())
        },
        ListenerOptions::sync().priority(10),
    );

    container.start()?;
    println!("{}", container.plan(&Request::of::<UserService>())?);

    for (request, user) in [("req-1", 42), ("req-2", 7)] {
        container.enter_scope("request", request)?;
        let scoped = container.in_context(ScopeContext::none().with("request", request));

        let service = scoped.get::<UserService>()?;
        println!("{}", service.get_user(user));
        container.publish(Event::new(UserViewed { id: user }))?;

        let report = container.exit_scope("request", request)?;
        println!("Closed {request}: destroyed {:?}", report.destroyed);
    }

    let report = container.shutdown(Duration::from_secs(5))?;
    println!("Shut down: destroyed {:?}", report.destroyed);
    Ok(())
}
