//! Integration tests for `SubjectCore`
//!
//! This crate hosts a small library domain (books, their copies and readers)
//! used by the tests under `tests/` to exercise the engine together with the
//! in-memory adapters.
//!
//! Subjects:
//! - `/book/{isbn}` carries `BookAdded`, `BookLent` and `BookReturned`
//! - `/book/{isbn}/copy/{n}` carries `CopyAdded`
//! - `/reader/{id}` carries `ReaderRegistered`
//!
//! Book state is rebuilt recursively so copies count towards their book.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use subjectcore::errors::ValidationError;
use subjectcore::types::{EventType, EventTypeError, SubjectError};
use subjectcore::upcasting::{migrations, EventTypeUpcaster};
use subjectcore::{
    Command, CommandError, CommandHandlerRegistry, CommandRouter, CommandRouterBuilder, DomainEvent,
    Event, EventHandler, EventHandlingError, EventStore, SourcingMode, StateRebuilder, Subject,
    SubjectCondition, UpcasterChain,
};
use thiserror::Error;
use tracing::debug;

/// A book was added to the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookAdded {
    /// The book's title
    pub title: String,
}

impl DomainEvent for BookAdded {
    const EVENT_TYPE: &'static str = "library.book.added.v1";
}

/// The first shape of `BookAdded`, which called the title `name`.
pub const LEGACY_BOOK_ADDED: &str = "library.book.added.v0";

/// A physical copy of a book was acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyAdded {
    /// The copy number, starting at one
    pub copy: u32,
}

impl DomainEvent for CopyAdded {
    const EVENT_TYPE: &'static str = "library.copy.added.v1";
}

/// A reader borrowed a copy of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLent {
    /// The borrowing reader
    pub reader: String,
}

impl DomainEvent for BookLent {
    const EVENT_TYPE: &'static str = "library.book.lent.v1";
}

/// A reader brought a copy back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookReturned {
    /// The returning reader
    pub reader: String,
}

impl DomainEvent for BookReturned {
    const EVENT_TYPE: &'static str = "library.book.returned.v1";
}

/// A reader got a library card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderRegistered {
    /// The reader's name
    pub name: String,
}

impl DomainEvent for ReaderRegistered {
    const EVENT_TYPE: &'static str = "library.reader.registered.v1";
}

/// A book as far as lending decisions are concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Book {
    /// Title, once the book was added
    pub title: Option<String>,
    /// Number of copies owned
    pub copies: u32,
    /// Readers currently holding a copy
    pub borrowers: Vec<String>,
}

impl Book {
    /// Copies on the shelf.
    pub fn available(&self) -> usize {
        usize::try_from(self.copies)
            .unwrap_or(usize::MAX)
            .saturating_sub(self.borrowers.len())
    }
}

/// Lending rules.
#[derive(Debug, Error)]
pub enum LibraryError {
    /// Every copy is lent out.
    #[error("No copy of '{0}' is available")]
    NoCopyAvailable(Subject),
    /// The reader already holds a copy.
    #[error("Reader '{reader}' already borrowed '{book}'")]
    AlreadyBorrowed {
        /// The book
        book: Subject,
        /// The reader
        reader: String,
    },
    /// The reader holds no copy.
    #[error("Reader '{reader}' did not borrow '{book}'")]
    NotBorrowed {
        /// The book
        book: Subject,
        /// The reader
        reader: String,
    },
}

impl From<LibraryError> for CommandError {
    fn from(error: LibraryError) -> Self {
        Self::BusinessRuleViolation(error.to_string())
    }
}

/// The subject of the book with `isbn`.
pub fn book(isbn: &str) -> Result<Subject, SubjectError> {
    Subject::root().child("book")?.child(isbn)
}

/// The subject of the reader with `id`.
pub fn reader(id: &str) -> Result<Subject, SubjectError> {
    Subject::root().child("reader")?.child(id)
}

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::InvalidCommand(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Adds a new book to the catalogue.
#[derive(Debug, Clone)]
pub struct AddBook {
    /// The book's subject
    pub book: Subject,
    /// The book's title
    pub title: String,
}

impl Command for AddBook {
    type Result = ();

    fn subject(&self) -> Subject {
        self.book.clone()
    }

    fn subject_condition(&self) -> SubjectCondition {
        SubjectCondition::Pristine
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("title", &self.title)
    }
}

/// Acquires one more copy of a catalogued book.
#[derive(Debug, Clone)]
pub struct AddCopy {
    /// The book's subject
    pub book: Subject,
}

impl Command for AddCopy {
    /// The new copy's number.
    type Result = u32;

    fn subject(&self) -> Subject {
        self.book.clone()
    }

    fn subject_condition(&self) -> SubjectCondition {
        SubjectCondition::Exists
    }
}

/// Lends a copy of a book to a reader.
#[derive(Debug, Clone)]
pub struct LendBook {
    /// The book's subject
    pub book: Subject,
    /// The borrowing reader
    pub reader: String,
}

impl Command for LendBook {
    /// Copies left on the shelf.
    type Result = usize;

    fn subject(&self) -> Subject {
        self.book.clone()
    }

    fn subject_condition(&self) -> SubjectCondition {
        SubjectCondition::Exists
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("reader", &self.reader)
    }
}

/// Takes a lent copy back.
#[derive(Debug, Clone)]
pub struct ReturnBook {
    /// The book's subject
    pub book: Subject,
    /// The returning reader
    pub reader: String,
}

impl Command for ReturnBook {
    type Result = ();

    fn subject(&self) -> Subject {
        self.book.clone()
    }

    fn subject_condition(&self) -> SubjectCondition {
        SubjectCondition::Exists
    }
}

/// Registers a reader.
#[derive(Debug, Clone)]
pub struct RegisterReader {
    /// The reader's subject
    pub reader: Subject,
    /// The reader's name
    pub name: String,
}

impl Command for RegisterReader {
    type Result = ();

    fn subject(&self) -> Subject {
        self.reader.clone()
    }

    fn subject_condition(&self) -> SubjectCondition {
        SubjectCondition::Pristine
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require("name", &self.name)
    }
}

/// Folds a book and its copies.
pub fn book_rebuilder() -> StateRebuilder<Book> {
    StateRebuilder::new(Book::default())
        .on(|book: Book, event: BookAdded| Book {
            title: Some(event.title),
            ..book
        })
        .on(|book: Book, event: CopyAdded| Book {
            copies: book.copies.max(event.copy),
            ..book
        })
        .on(|mut book: Book, event: BookLent| {
            book.borrowers.push(event.reader);
            book
        })
        .on(|mut book: Book, event: BookReturned| {
            book.borrowers.retain(|reader| reader != &event.reader);
            book
        })
}

/// Every command handler of the library.
pub fn library_registry() -> CommandHandlerRegistry {
    CommandHandlerRegistry::new()
        .register(
            book_rebuilder(),
            SourcingMode::Recursive,
            |command: AddBook, _: &Book, publisher| {
                publisher.publish(&BookAdded {
                    title: command.title,
                })
            },
        )
        .register(
            book_rebuilder(),
            SourcingMode::Recursive,
            |_: AddCopy, book: &Book, publisher| {
                let copy = book.copies + 1;
                publisher.publish_relative(&format!("copy/{copy}"), &CopyAdded { copy })?;
                Ok(copy)
            },
        )
        .register(
            book_rebuilder(),
            SourcingMode::Recursive,
            |command: LendBook, book: &Book, publisher| {
                if book.borrowers.contains(&command.reader) {
                    return Err(LibraryError::AlreadyBorrowed {
                        book: command.book,
                        reader: command.reader,
                    }
                    .into());
                }
                if book.available() == 0 {
                    return Err(LibraryError::NoCopyAvailable(command.book).into());
                }
                publisher.publish(&BookLent {
                    reader: command.reader,
                })?;
                Ok(book.available() - 1)
            },
        )
        .register(
            book_rebuilder(),
            SourcingMode::Recursive,
            |command: ReturnBook, book: &Book, publisher| {
                if !book.borrowers.contains(&command.reader) {
                    return Err(LibraryError::NotBorrowed {
                        book: command.book,
                        reader: command.reader,
                    }
                    .into());
                }
                publisher.publish(&BookReturned {
                    reader: command.reader,
                })
            },
        )
        .register_stateless(|command: RegisterReader, publisher| {
            publisher.publish(&ReaderRegistered { name: command.name })
        })
}

/// Upcasts legacy `BookAdded` events, renaming `name` to `title`.
pub fn library_upcasters() -> Result<UpcasterChain, EventTypeError> {
    let legacy = EventType::try_new(LEGACY_BOOK_ADDED)?;
    let current = EventType::try_new(BookAdded::EVENT_TYPE)?;
    let rename = migrations::rename_field("name", "title");
    Ok(UpcasterChain::new().with(EventTypeUpcaster::new(legacy, current).with_migration(rename)))
}

/// A router over `store` with every library handler and upcaster.
pub fn library_router(
    store: Arc<dyn EventStore>,
) -> Result<CommandRouterBuilder, EventTypeError> {
    Ok(CommandRouter::builder(store, library_registry()).with_upcasters(library_upcasters()?))
}

/// Tracks which reader holds which books, fed by lending events.
#[derive(Debug, Clone, Default)]
pub struct LendingLedger {
    loans: Arc<Mutex<HashMap<String, Vec<Subject>>>>,
    handled: Arc<Mutex<Vec<Event>>>,
}

impl LendingLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Books `reader` currently holds.
    pub fn loans_of(&self, reader: &str) -> Vec<Subject> {
        self.loans.lock().get(reader).cloned().unwrap_or_default()
    }

    /// Every event handled so far, in handling order.
    pub fn handled(&self) -> Vec<Event> {
        self.handled.lock().clone()
    }
}

#[async_trait]
impl EventHandler for LendingLedger {
    fn name(&self) -> &str {
        "lending-ledger"
    }

    fn handles(&self, event_type: &str) -> bool {
        event_type == BookLent::EVENT_TYPE || event_type == BookReturned::EVENT_TYPE
    }

    async fn handle(&self, event: &Event) -> Result<(), EventHandlingError> {
        let failed = |error: serde_json::Error| EventHandlingError::HandlerFailed {
            handler: self.name().to_string(),
            event_id: event.id,
            reason: error.to_string(),
        };
        if event.is_type(BookLent::EVENT_TYPE) {
            let lent = event.payload_as::<BookLent>().map_err(failed)?;
            debug!(reader = %lent.reader, book = %event.subject, "Loan recorded");
            self.loans
                .lock()
                .entry(lent.reader)
                .or_default()
                .push(event.subject.clone());
        } else {
            let returned = event.payload_as::<BookReturned>().map_err(failed)?;
            debug!(reader = %returned.reader, book = %event.subject, "Loan closed");
            if let Some(books) = self.loans.lock().get_mut(&returned.reader) {
                books.retain(|book| book != &event.subject);
            }
        }
        self.handled.lock().push(event.clone());
        Ok(())
    }
}
