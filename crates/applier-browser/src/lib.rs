//! Page automation for Applier
//!
//! This crate provides everything that runs against a page of the target site:
//!
//! - [`dom`]: synthetic document model read from a live page
//! - [`selector`]: compound-selector parser and fallback locator chains
//! - [`page`]: the [`Page`] contract plus the [`PageFactory`] that opens tabs
//! - [`driver`]: readiness waits, form filling, submission, success and login detection
//! - [`cdp`] and [`browser`]: the Chrome DevTools Protocol backend
//!
//! # Requirements
//!
//! - Chrome or Chromium browser installed for the CDP backend
//! - For connecting to existing browser: `chrome --remote-debugging-port=9222`

pub mod browser;
pub mod cdp;
pub mod dom;
pub mod driver;
pub mod page;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;
pub mod selector;

pub use browser::BrowserSession;
pub use cdp::ChromePage;
pub use dom::{DomNode, DomSnapshot, NodeId, ReadyState};
pub use driver::{AutomationDriver, DriverTiming, PageInfo, ScreeningReport, SiteProfile};
pub use page::{Page, PageFactory};
pub use selector::{Locator, LocatorChain, Selector};
