use crate::{FileState, StateProperty};
use std::sync::Mutex;
use tracing::*;

/// Receives per-file progress updates, addressed by file index.
pub trait FileStateSink: Send + Sync {
    fn update_file_at_index(&self, index: usize, property: StateProperty, value: FileState);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaygroundFile {
    pub name: String,
    pub extract_state: FileState,
    pub instruction_extraction_state: FileState,
    pub key_value_state: FileState,
    pub qa_state: FileState,
}

impl PlaygroundFile {
    pub fn new(name: impl Into<String>) -> Self {
        PlaygroundFile {
            name: name.into(),
            extract_state: StateProperty::ExtractState.ready(),
            instruction_extraction_state: StateProperty::InstructionExtractionState.ready(),
            key_value_state: StateProperty::KeyValueState.ready(),
            qa_state: StateProperty::QaState.ready(),
        }
    }

    pub fn get(&self, property: StateProperty) -> FileState {
        match property {
            StateProperty::ExtractState => self.extract_state,
            StateProperty::InstructionExtractionState => self.instruction_extraction_state,
            StateProperty::KeyValueState => self.key_value_state,
            StateProperty::QaState => self.qa_state,
        }
    }

    fn slot_mut(&mut self, property: StateProperty) -> &mut FileState {
        match property {
            StateProperty::ExtractState => &mut self.extract_state,
            StateProperty::InstructionExtractionState => &mut self.instruction_extraction_state,
            StateProperty::KeyValueState => &mut self.key_value_state,
            StateProperty::QaState => &mut self.qa_state,
        }
    }
}

/// In-memory file list shared between concurrent submissions.
#[derive(Debug, Default)]
pub struct FileTable {
    files: Mutex<Vec<PlaygroundFile>>,
}

impl FileTable {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        FileTable {
            files: Mutex::new(names.into_iter().map(PlaygroundFile::new).collect()),
        }
    }

    pub fn snapshot(&self) -> Vec<PlaygroundFile> {
        match self.files.lock() {
            Ok(files) => files.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, index: usize) -> Option<PlaygroundFile> {
        self.snapshot().into_iter().nth(index)
    }
}

impl FileStateSink for FileTable {
    fn update_file_at_index(&self, index: usize, property: StateProperty, value: FileState) {
        let mut files = match self.files.lock() {
            Ok(files) => files,
            Err(poisoned) => poisoned.into_inner(),
        };
        match files.get_mut(index) {
            Some(file) => {
                debug!(message = "Updating file state", index, property = %property, value = %value);
                *file.slot_mut(property) = value;
            }
            None => {
                warn!(message = "No file at index, ignoring state update", index, property = %property);
            }
        }
    }
}
