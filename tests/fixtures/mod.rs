//! Shared test data: the COCO class table and queue message bodies.
#![allow(dead_code)]

/// The 80 COCO class names in model index order.
pub const COCO_NAMES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

pub fn coco_names() -> Vec<String> {
    COCO_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Stand-in bytes for an uploaded JPEG; the fake detector copies them verbatim.
pub const CAT_JPEG: &[u8] = b"\xff\xd8\xff\xe0fake-jpeg-body\xff\xd9";

pub fn job_body(img_name: &str, chat_id: &str) -> String {
    serde_json::json!({ "img_name": img_name, "chat_id": chat_id }).to_string()
}

pub const CAT_JOB: &str = r#"{"img_name":"cat.jpg","chat_id":"42"}"#;
pub const MISSING_CHAT_ID: &str = r#"{"img_name":"cat.jpg"}"#;
pub const EMPTY_IMAGE_NAME: &str = r#"{"img_name":"","chat_id":"42"}"#;
pub const NUMERIC_CHAT_ID: &str = r#"{"img_name":"cat.jpg","chat_id":42}"#;
pub const NOT_JSON: &str = "cat.jpg 42";

/// One detection of class 15 ("cat").
pub const CAT_LINE: &str = "15 0.5 0.5 0.2 0.3\n";
