//! In-memory fakes for exercising a session without a document viewer.
//!
//! [`ScriptedEngine`] implements [`AnnotationEngine`] over plain maps and
//! records everything done to it, so tests can assert on styling, metadata,
//! and deletions. [`RecordingDocumentStore`] accepts saves and lets the test
//! decide when and how they finish. [`capture`] collects bus traffic for a
//! topic.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use anyhow::{anyhow, Result};

use crate::bus::EventBus;
use crate::events::{Topic, ViewerEvent};
use crate::marks::{AnnotationEngine, MarkKind, MetaKey, SharedEngine};
use crate::model::{FormDefinition, MarkId, PageSize, Rectangle};
use crate::pending::OpToken;
use crate::save::FormDocumentStore;

/// One fake mark with every attribute the engine can touch.
#[derive(Clone, Debug)]
pub struct FakeMark {
    pub kind: MarkKind,
    pub page_number: u32,
    pub rectangle: Rectangle,
    pub metadata: HashMap<&'static str, String>,
    pub text: Option<String>,
    pub path: Option<String>,
    pub image: Option<String>,
    pub border: Option<(String, f64)>,
    pub fill: Option<(String, u8)>,
    pub font: Option<(String, String, f64)>,
    pub locked: bool,
}

/// Scriptable in-memory annotation layer.
#[derive(Default)]
pub struct ScriptedEngine {
    next_id: u32,
    pages: HashMap<u32, PageSize>,
    marks: BTreeMap<MarkId, FakeMark>,
    pub deleted: Vec<MarkId>,
    pub selection: Vec<MarkId>,
    pub scrolled_to: Vec<MarkId>,
    pub edits_begun: Vec<MarkId>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, page_number: u32, size: PageSize) -> Self {
        self.pages.insert(page_number, size);
        self
    }

    pub fn shared(self) -> (SharedEngine, Rc<RefCell<ScriptedEngine>>) {
        let concrete = Rc::new(RefCell::new(self));
        let erased: SharedEngine = Rc::clone(&concrete) as SharedEngine;
        (erased, concrete)
    }

    pub fn mark(&self, id: MarkId) -> Option<&FakeMark> {
        self.marks.get(&id)
    }

    pub fn mark_ids(&self) -> Vec<MarkId> {
        self.marks.keys().copied().collect()
    }

    /// Marks carrying a given metadata value, e.g. every target of a field.
    pub fn marks_tagged(&self, key: MetaKey, value: &str) -> Vec<MarkId> {
        self.marks
            .iter()
            .filter(|(_, m)| m.metadata.get(key.as_str()).map(String::as_str) == Some(value))
            .map(|(id, _)| *id)
            .collect()
    }

    fn get_mut(&mut self, id: MarkId) -> Result<&mut FakeMark> {
        self.marks.get_mut(&id).ok_or_else(|| anyhow!("no mark {}", id))
    }
}

impl AnnotationEngine for ScriptedEngine {
    fn create_mark(
        &mut self,
        page_number: u32,
        kind: MarkKind,
        rectangle: Rectangle,
    ) -> Result<MarkId> {
        self.next_id += 1;
        let id = MarkId(self.next_id);
        self.marks.insert(
            id,
            FakeMark {
                kind,
                page_number,
                rectangle,
                metadata: HashMap::new(),
                text: None,
                path: None,
                image: None,
                border: None,
                fill: None,
                font: None,
                locked: false,
            },
        );
        Ok(id)
    }

    fn delete_marks(&mut self, ids: &[MarkId]) -> Result<()> {
        for id in ids {
            self.marks.remove(id);
            self.deleted.push(*id);
        }
        Ok(())
    }

    fn mark_exists(&self, id: MarkId) -> bool {
        self.marks.contains_key(&id)
    }

    fn kind(&self, id: MarkId) -> Option<MarkKind> {
        self.marks.get(&id).map(|m| m.kind)
    }

    fn page_number(&self, id: MarkId) -> Option<u32> {
        self.marks.get(&id).map(|m| m.page_number)
    }

    fn rectangle(&self, id: MarkId) -> Option<Rectangle> {
        self.marks.get(&id).map(|m| m.rectangle)
    }

    fn set_rectangle(&mut self, id: MarkId, rectangle: Rectangle) -> Result<()> {
        self.get_mut(id)?.rectangle = rectangle;
        Ok(())
    }

    fn metadata(&self, id: MarkId, key: MetaKey) -> Option<String> {
        self.marks.get(&id)?.metadata.get(key.as_str()).cloned()
    }

    fn set_metadata(&mut self, id: MarkId, key: MetaKey, value: &str) -> Result<()> {
        self.get_mut(id)?.metadata.insert(key.as_str(), value.to_string());
        Ok(())
    }

    fn text(&self, id: MarkId) -> Option<String> {
        self.marks.get(&id)?.text.clone()
    }

    fn set_text(&mut self, id: MarkId, text: &str) -> Result<()> {
        self.get_mut(id)?.text = Some(text.to_string());
        Ok(())
    }

    fn path(&self, id: MarkId) -> Option<String> {
        self.marks.get(&id)?.path.clone()
    }

    fn set_path(&mut self, id: MarkId, path: &str) -> Result<()> {
        self.get_mut(id)?.path = Some(path.to_string());
        Ok(())
    }

    fn image(&self, id: MarkId) -> Option<String> {
        self.marks.get(&id)?.image.clone()
    }

    fn set_image(&mut self, id: MarkId, image_key: &str) -> Result<()> {
        self.get_mut(id)?.image = Some(image_key.to_string());
        Ok(())
    }

    fn set_border(&mut self, id: MarkId, color: &str, thickness: f64) -> Result<()> {
        self.get_mut(id)?.border = Some((color.to_string(), thickness));
        Ok(())
    }

    fn set_fill(&mut self, id: MarkId, color: &str, opacity: u8) -> Result<()> {
        self.get_mut(id)?.fill = Some((color.to_string(), opacity));
        Ok(())
    }

    fn set_font(&mut self, id: MarkId, name: &str, color: &str, size: f64) -> Result<()> {
        self.get_mut(id)?.font = Some((name.to_string(), color.to_string(), size));
        Ok(())
    }

    fn set_locked(&mut self, id: MarkId, locked: bool) -> Result<()> {
        self.get_mut(id)?.locked = locked;
        Ok(())
    }

    fn begin_text_edit(&mut self, id: MarkId) -> Result<()> {
        if !self.marks.contains_key(&id) {
            return Err(anyhow!("no mark {}", id));
        }
        self.edits_begun.push(id);
        Ok(())
    }

    fn scroll_to(&mut self, id: MarkId) -> Result<()> {
        self.scrolled_to.push(id);
        Ok(())
    }

    fn select(&mut self, ids: &[MarkId]) -> Result<()> {
        self.selection = ids.to_vec();
        Ok(())
    }

    fn page_size(&self, page_number: u32) -> Option<PageSize> {
        self.pages.get(&page_number).copied()
    }
}

/// Document store that remembers saves and never finishes them on its own;
/// the test publishes `SaveFinished` when it wants a completion.
#[derive(Default)]
pub struct RecordingDocumentStore {
    pub saves: Vec<(OpToken, FormDefinition)>,
}

impl FormDocumentStore for RecordingDocumentStore {
    fn begin_save(&mut self, token: OpToken, definition: &FormDefinition) -> Result<()> {
        self.saves.push((token, definition.clone()));
        Ok(())
    }
}

/// Collect every event published to a topic.
pub fn capture(bus: &EventBus, topic: Topic) -> Rc<RefCell<Vec<ViewerEvent>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    bus.subscribe(topic, move |_, event| {
        sink.borrow_mut().push(event.clone());
    });
    seen
}
