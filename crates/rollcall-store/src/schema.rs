/// Schema statements, applied in order on every open. Each is idempotent.
pub const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS students (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        roster_id TEXT,
        dataset_key TEXT NOT NULL UNIQUE,
        photos TEXT NOT NULL DEFAULT '[]',
        embedding TEXT,
        is_training_complete INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS attendance_sessions (
        id TEXT PRIMARY KEY,
        class_id TEXT,
        capture_date TEXT NOT NULL,
        status TEXT NOT NULL,
        total_images INTEGER NOT NULL DEFAULT 0,
        total_faces_detected INTEGER NOT NULL DEFAULT 0,
        total_students_recognized INTEGER NOT NULL DEFAULT 0,
        average_confidence REAL NOT NULL DEFAULT 0,
        failure_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS recognition_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES attendance_sessions(id),
        student_id TEXT REFERENCES students(id),
        label TEXT,
        confidence REAL NOT NULL,
        image_index INTEGER NOT NULL,
        bbox_x REAL NOT NULL,
        bbox_y REAL NOT NULL,
        bbox_width REAL NOT NULL,
        bbox_height REAL NOT NULL,
        accepted INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_results_session ON recognition_results(session_id)",
    "CREATE TABLE IF NOT EXISTS attendance_records (
        session_id TEXT NOT NULL REFERENCES attendance_sessions(id),
        student_id TEXT NOT NULL REFERENCES students(id),
        is_present INTEGER NOT NULL,
        confidence REAL NOT NULL,
        detection_count INTEGER NOT NULL,
        PRIMARY KEY (session_id, student_id)
    )",
];
