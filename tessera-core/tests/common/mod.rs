#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::{json, Value};
use tessera_core::{ConfigLayers, Converter, Registry};

fn line(text: &str, y0: f32, font: f32) -> Value {
    json!({
        "text": text,
        "bbox": {"x0": 72.0, "y0": y0, "x1": 72.0 + text.len() as f32 * font * 0.5, "y1": y0 + font * 1.2},
        "style": {"font_size": font}
    })
}

/// Three pages: a heading and a two-line paragraph, then a 2x2 table with a
/// line under it, then a single line.
pub fn three_page_layout() -> Value {
    json!({
        "title": "Quarterly report",
        "pages": [
            {
                "width": 612.0, "height": 792.0,
                "lines": [
                    line("Introduction", 72.0, 18.0),
                    line("This is the first line of", 110.0, 10.0),
                    line("the introduction.", 124.0, 10.0)
                ]
            },
            {
                "width": 612.0, "height": 792.0,
                "lines": [line("After the table.", 200.0, 10.0)],
                "tables": [{
                    "bbox": {"x0": 72.0, "y0": 100.0, "x1": 300.0, "y1": 160.0},
                    "cells": [
                        {"row": 0, "col": 0, "text": "Name", "header": true},
                        {"row": 0, "col": 1, "text": "Qty", "header": true},
                        {"row": 1, "col": 0, "text": "apple"},
                        {"row": 1, "col": 1, "text": "3"}
                    ]
                }]
            },
            {
                "width": 612.0, "height": 792.0,
                "lines": [line("Last page.", 100.0, 10.0)]
            }
        ]
    })
}

pub fn write(dir: &Path, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path
}

pub fn write_json(dir: &Path, name: &str, value: &Value) -> PathBuf {
    write(dir, name, serde_json::to_vec(value).expect("serialize fixture"))
}

pub fn converter(layers: ConfigLayers) -> Converter {
    let registry = Registry::with_defaults().expect("default registry");
    Converter::new(Arc::new(registry), layers).expect("valid settings")
}
