//! HTML pages.
use crate::storage::AssetId;

/// Assets to show after a still image was processed.
#[derive(Debug, Default)]
pub struct ImagePage {
    pub original: Option<AssetId>,
    pub result: Option<AssetId>,
}

const HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Object Detection</title>
    <style>
        body { font-family: sans-serif; margin: 2em auto; max-width: 60em; }
        form { margin-bottom: 1.5em; }
        img { max-width: 100%; }
        .results { display: flex; gap: 1em; }
        .results figure { flex: 1; margin: 0; }
    </style>
</head>
<body>
    <h1>Object Detection</h1>
"#;

/// Formats accepted by the video form.
#[cfg(feature = "ffmpeg")]
pub const VIDEO_FORMATS: &str =
    "Any container ffmpeg can read, animated GIF, motion JPEG (.mjpg) and still images.";
#[cfg(not(feature = "ffmpeg"))]
pub const VIDEO_FORMATS: &str = "Animated GIF, motion JPEG (.mjpg) and still images. \
    MP4 and other containers need a build with the <code>ffmpeg</code> feature.";

fn forms() -> String {
    format!(
        r#"
    <h3>Image</h3>
    <form action="/imgpred" method="post" enctype="multipart/form-data">
        <input type="file" name="image" accept="image/*">
        <input type="submit" value="Detect">
    </form>
    <h3>Video</h3>
    <form action="/vidpred" method="post" enctype="multipart/form-data">
        <input type="file" name="file" accept="video/*,image/*,.mjpg,.mjpeg">
        <input type="submit" value="Stream">
    </form>
    <p><small>{VIDEO_FORMATS}</small></p>
    <p><a href="/live_feed">Live camera feed</a> &middot; <a href="/delete">Start storage cleanup</a></p>
"#
    )
}

const TAIL: &str = r#"
</body>
</html>
"#;

/// Landing page with both upload forms.
pub fn index_page() -> String {
    [HEAD, forms().as_str(), TAIL].concat()
}

/// Image form, followed by the processed image if there is one.
pub fn image_page(page: &ImagePage) -> String {
    let mut html = [HEAD, forms().as_str()].concat();

    if page.original.is_some() || page.result.is_some() {
        html.push_str("    <div class=\"results\">\n");
        if let Some(original) = &page.original {
            html.push_str(&figure("Uploaded image", original));
        }
        if let Some(result) = &page.result {
            html.push_str(&figure("Detections", result));
        }
        html.push_str("    </div>\n");
    }

    html.push_str(TAIL);
    html
}

/// Path under which a stored asset is served.
pub fn asset_url(id: &AssetId) -> String {
    format!("/static/{id}")
}

fn figure(caption: &str, id: &AssetId) -> String {
    format!(
        "        <figure><img src=\"{}\" alt=\"{caption}\"><figcaption>{caption}</figcaption></figure>\n",
        asset_url(id)
    )
}
