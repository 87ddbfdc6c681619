use storage::StorageService;

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
}

impl AppState {
    pub fn new(storage: StorageService) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &StorageService {
        &self.storage
    }
}
