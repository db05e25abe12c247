use mosaic_engine::Engine;

pub(crate) fn viewer(engine: &Engine) -> String {
    fill(VIEWER_HTML, engine)
}

pub(crate) fn client(engine: &Engine) -> String {
    fill(CLIENT_HTML, engine)
}

fn fill(template: &str, engine: &Engine) -> String {
    template
        .replace("{{columns}}", &engine.columns().to_string())
        .replace("{{rows}}", &engine.rows().to_string())
}

const VIEWER_HTML: &str = r###"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Mosaic</title>
  <style>
    *{box-sizing:border-box;margin:0;padding:0}
    html,body{width:100%;height:100%;background:#050913;color:#e6fbff;font-family:Inter,system-ui,sans-serif}
    .wrap{display:flex;flex-direction:column;align-items:center;gap:12px;padding:16px}
    #grid{display:grid;gap:0;max-width:96vw}
    #grid img{display:block;width:100%;height:auto;image-rendering:pixelated;background:#0b1a2d}
    .status{font-size:12px;color:#8aa3be}
  </style>
</head>
<body>
  <div class="wrap">
    <div id="grid"></div>
    <div class="status" id="status">connecting</div>
  </div>
  <script>
  (function(){
    const columns = {{columns}};
    const rows = {{rows}};
    const grid = document.getElementById("grid");
    const status = document.getElementById("status");
    grid.style.gridTemplateColumns = `repeat(${columns}, 1fr)`;

    const tiles = {};
    for (let row = 0; row < rows; row++){
      for (let column = 0; column < columns; column++){
        const img = document.createElement("img");
        img.alt = `${column}/${row}`;
        tiles[`${column}/${row}`] = img;
        grid.appendChild(img);
      }
    }

    function connect(){
      const scheme = location.protocol === "https:" ? "wss" : "ws";
      const ws = new WebSocket(`${scheme}://${location.host}/ws`);
      ws.onopen = () => { status.textContent = "live"; };
      ws.onmessage = (ev) => {
        const u = JSON.parse(ev.data);
        const img = tiles[`${u.column}/${u.row}`];
        if (img) img.src = `data:image/png;base64,${u.image}`;
      };
      ws.onclose = () => {
        status.textContent = "reconnecting";
        setTimeout(connect, 1000);
      };
    }
    connect();
  })();
  </script>
</body>
</html>
"###;

const CLIENT_HTML: &str = r###"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Mosaic client</title>
  <style>
    *{box-sizing:border-box;margin:0;padding:0}
    html,body{width:100%;height:100%;background:#050913;color:#e6fbff;font-family:Inter,system-ui,sans-serif}
    .wrap{display:flex;flex-direction:column;align-items:center;gap:14px;padding:24px}
    #tile{width:min(70vw,420px);image-rendering:pixelated;border:1px solid #73c7ff55;cursor:pointer}
    .btn{border:1px solid #4f799f;background:#0b1b30;color:#e6fbff;border-radius:10px;padding:8px 12px;font-weight:600;cursor:pointer}
    .status{font-size:12px;color:#8aa3be}
  </style>
</head>
<body>
  <div class="wrap">
    <img id="tile" alt="your tile" />
    <button id="change" class="btn" type="button">another tile</button>
    <div class="status" id="status">connecting</div>
  </div>
  <script>
  (function(){
    const grid = { columns: {{columns}}, rows: {{rows}} };
    const img = document.getElementById("tile");
    const status = document.getElementById("status");
    let tile = null;
    let ws = null;

    function refresh(){
      if (!tile) return;
      img.src = `/api/image/column/${tile.column}/row/${tile.row}?t=${Date.now()}`;
    }

    function connect(){
      const scheme = location.protocol === "https:" ? "wss" : "ws";
      ws = new WebSocket(`${scheme}://${location.host}/ws-client`);
      ws.onmessage = (ev) => {
        const msg = JSON.parse(ev.data);
        if (msg.code){ status.textContent = msg.message; return; }
        tile = msg;
        status.textContent = `tile ${tile.column}/${tile.row} of ${grid.columns}x${grid.rows}`;
        refresh();
      };
      ws.onclose = () => {
        status.textContent = "reconnecting";
        setTimeout(connect, 1500);
      };
    }

    img.addEventListener("click", () => {
      if (ws && ws.readyState === WebSocket.OPEN){
        ws.send("toggle");
        setTimeout(refresh, 50);
      }
    });
    document.getElementById("change").addEventListener("click", () => {
      if (ws && ws.readyState === WebSocket.OPEN) ws.send("change-tile");
    });
    connect();
  })();
  </script>
</body>
</html>
"###;
